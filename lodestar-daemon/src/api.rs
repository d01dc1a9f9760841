//! Local API routes and the status page.
//!
//! Requests arrive here already identified and registered; the permission
//! triple computed for the caller decides which routes it may use.

use serde::{Deserialize, Serialize};
use tracing::warn;

use lodestar_protocol::protocol::{Method, Request, Response, status};

use crate::backend::{Backend, BackendStatus};
use crate::errors::DaemonError;
use crate::identity::ConnIdentity;
use crate::permissions::Permissions;
use crate::platform::Platform;

const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'; script-src 'none'; script-src-elem 'none'; script-src-attr 'none'";

#[derive(Debug, Serialize)]
struct WhoAmI<'a> {
    identity: &'a ConnIdentity,
    uid: Option<u32>,
    permissions: Permissions,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrefsView {
    persistent_server_mode: bool,
    persistent_owner: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PrefsUpdate {
    persistent_server_mode: bool,
}

fn denied(what: &str) -> Response {
    Response::error(status::FORBIDDEN, format!("{} access denied", what))
}

fn method_not_allowed() -> Response {
    Response::error(status::METHOD_NOT_ALLOWED, "method not allowed")
}

fn daemon_error(e: &DaemonError) -> Response {
    let code = match e {
        DaemonError::Unsupported(_) => status::NOT_FOUND,
        DaemonError::PrefsInvalid(_) => status::SERVICE_UNAVAILABLE,
        _ => status::INTERNAL_SERVER_ERROR,
    };
    Response::error(code, e.to_string())
}

fn prefs_view(current: BackendStatus) -> PrefsView {
    PrefsView {
        persistent_server_mode: current.persistent_server_mode,
        persistent_owner: current.persistent_owner,
    }
}

/// Serve a `/localapi/` request. `route` is the path below the prefix.
pub fn handle_local_api(
    backend: &dyn Backend,
    identity: &ConnIdentity,
    permissions: Permissions,
    request: &Request,
    route: &str,
) -> Response {
    match route {
        "v0/status" => {
            if request.method != Method::Get {
                return method_not_allowed();
            }
            if !permissions.read {
                return denied("status");
            }
            Response::json(&backend.status())
        }
        "v0/whoami" => {
            if request.method != Method::Get {
                return method_not_allowed();
            }
            if !permissions.read {
                return denied("whoami");
            }
            Response::json(&WhoAmI {
                identity,
                uid: identity.creds().map(|c| c.uid),
                permissions,
            })
        }
        "v0/prefs" => match request.method {
            Method::Get => {
                if !permissions.read {
                    return denied("prefs read");
                }
                Response::json(&prefs_view(backend.status()))
            }
            Method::Post => {
                if !permissions.write {
                    return denied("prefs write");
                }
                let update: PrefsUpdate = match serde_json::from_slice(&request.body) {
                    Ok(update) => update,
                    Err(e) => {
                        return Response::error(status::BAD_REQUEST, format!("invalid prefs: {}", e));
                    }
                };
                // Unix peers have no session user id, so no owner is recorded
                let owner = (!identity.user_id.is_empty()).then_some(identity.user_id.as_str());
                match backend.set_persistent_server_mode(update.persistent_server_mode, owner) {
                    Ok(()) => Response::json(&prefs_view(backend.status())),
                    Err(e) => {
                        warn!("Failed to update prefs: {}", e);
                        daemon_error(&e)
                    }
                }
            }
            _ => method_not_allowed(),
        },
        _ => {
            if let Some(domain) = route.strip_prefix("v0/cert/") {
                if request.method != Method::Get {
                    return method_not_allowed();
                }
                if !permissions.fetch_cert && !permissions.write {
                    return denied("cert");
                }
                return match backend.cert_pair(domain) {
                    Ok(pair) => Response::json(&pair),
                    Err(e) => daemon_error(&e),
                };
            }
            Response::not_found()
        }
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_status_html(status: &BackendStatus) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><title>lodestar</title></head><body>\n<h1>lodestar</h1>\n<table>\n",
    );
    let mut row = |name: &str, value: &str| {
        html.push_str(&format!(
            "<tr><th>{}</th><td>{}</td></tr>\n",
            name,
            escape_html(value)
        ));
    };
    row("State", status.state.as_str());
    row("Version", &status.version);
    row("Active user", status.active_user.as_deref().unwrap_or("-"));
    row(
        "Server mode",
        if status.persistent_server_mode { "on" } else { "off" },
    );
    row("Server mode owner", status.persistent_owner.as_deref().unwrap_or("-"));
    let started = status
        .started_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    row("Started", &started);
    row("Resets", &status.resets.to_string());
    html.push_str("</table>\n</body></html>\n");
    html
}

/// Response for `GET /`.
pub fn status_page(platform: Platform, backend: &dyn Backend) -> Response {
    if platform.uses_named_pipes() {
        return Response::ok(render_status_html(&backend.status()))
            .with_header("Content-Security-Policy", CONTENT_SECURITY_POLICY)
            .with_header("X-Frame-Options", "DENY")
            .with_header("X-Content-Type-Options", "nosniff")
            .with_header("Content-Type", "text/html; charset=utf-8");
    }
    Response::ok(
        "<html><title>lodestar</title><body><h1>lodestar</h1>This is the local lodestar daemon.\n",
    )
    .with_header("Content-Type", "text/html; charset=utf-8")
}

#[cfg(test)]
mod tests;
