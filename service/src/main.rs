// SPDX-License-Identifier:

//! HTTP front end for the key-issuing service.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::Read;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rki_protocol::types::{self, ErrorResponse};
use rki_protocol::{Identity, RkiError};
use rki_service::handlers::ServiceState;
use rki_service::registry::Registry;
use rki_service::upstream::{
    HttpAuthorization, HttpKeyDerivation, LocalKeyDerivation, StaticAuthorization,
};

const MAX_BODY: usize = 128 * 1024;

const REGISTER_ROUTE: &str = "/p2pe/register-terminal-for-remote-key-injection";
const KEY_ROUTE: &str = "/p2pe/get-key-from-registered-terminal-for-remote-key-injection";

#[derive(Debug, Parser)]
#[command(name = "rki-service")]
struct Args {
    /// Bind IP address for the HTTP server.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Bind port for the HTTP server.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Directory holding the service identity and the terminal registry.
    #[arg(long, default_value = "service-state")]
    state_dir: String,

    /// Credentialing service endpoint. When absent, the static api-key
    /// allowlist from `--api-key` is used instead.
    #[arg(long)]
    authorization_url: Option<String>,

    /// Accepted api key for the static allowlist; may repeat.
    #[arg(long)]
    api_key: Vec<String>,

    /// Key-derivation authority endpoint. When absent, the in-process
    /// stand-in derivation is used (development only).
    #[arg(long)]
    derivation_url: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let state_dir = std::path::Path::new(&args.state_dir);
    let identity = Identity::load_or_generate(&state_dir.join("service_private_key.pem"))?;
    let registry = Registry::open(&state_dir.join("terminals.json"))?;

    let authorization: Box<dyn rki_service::upstream::CallerAuthorization> =
        match &args.authorization_url {
            Some(url) => Box::new(HttpAuthorization::new(url.clone())),
            None if !args.api_key.is_empty() => Box::new(StaticAuthorization::new(
                args.api_key
                    .iter()
                    .map(|k| (k.clone(), "local".to_string())),
            )),
            None => {
                return Err(anyhow!(
                    "no caller authorization configured: pass --authorization-url or --api-key"
                ))
            }
        };
    let derivation: Box<dyn rki_service::upstream::KeyDerivation> = match &args.derivation_url {
        Some(url) => Box::new(HttpKeyDerivation::new(url.clone())),
        None => {
            warn!("no --derivation-url given, using the in-process stand-in derivation");
            Box::new(LocalKeyDerivation)
        }
    };

    let state = ServiceState {
        identity,
        registry,
        authorization,
        derivation,
    };

    let bind = format!("{}:{}", args.ip, args.port);
    let server = Server::http(&bind).map_err(|e| anyhow!(e.to_string()))?;
    let json_header = Header::from_bytes(&b"content-type"[..], &b"application/json"[..])
        .map_err(|_| anyhow!("failed to build response header"))?;
    info!(%bind, "key-issuing service listening");

    for mut request in server.incoming_requests() {
        let (status, body) = handle(&state, &mut request);
        let response = Response::from_string(body)
            .with_status_code(StatusCode(status))
            .with_header(json_header.clone());
        let _ = request.respond(response);
    }

    Ok(())
}

fn handle(state: &ServiceState, request: &mut Request) -> (u16, String) {
    if request.method() != &Method::Post {
        return error_body(405, "only POST is supported");
    }
    let route = request.url().to_owned();

    let mut body = Vec::new();
    if request
        .as_reader()
        .take(MAX_BODY as u64)
        .read_to_end(&mut body)
        .is_err()
    {
        return error_body(400, "failed to read request body");
    }
    let body = match String::from_utf8(body) {
        Ok(s) => s,
        Err(_) => return error_body(400, "request body is not valid UTF-8"),
    };

    let api_key = match bearer_api_key(request) {
        Some(key) => key,
        None => return error_body(401, "missing bearer credential"),
    };

    match dispatch(state, &route, &api_key, &body) {
        Ok(reply) => (200, reply),
        Err(e) => {
            warn!(%route, error = %e, "request failed");
            peer_error(&e)
        }
    }
}

fn dispatch(
    state: &ServiceState,
    route: &str,
    api_key: &str,
    body: &str,
) -> Result<String, RkiError> {
    let caller = state.authorize_caller(api_key)?;
    match route {
        REGISTER_ROUTE => {
            let request = types::from_json(body)?;
            let response = state.register_terminal(&caller, &request)?;
            types::to_json(&response)
        }
        KEY_ROUTE => {
            let request = types::from_json(body)?;
            let response = state.issue_key(&caller, &request)?;
            types::to_json(&response)
        }
        _ => Err(RkiError::MalformedMessage(format!("unknown route: {route}"))),
    }
}

/// Strips a case-insensitive `Bearer ` prefix from the Authorization header.
fn bearer_api_key(request: &Request) -> Option<String> {
    let value = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("authorization"))
        .map(|h| h.value.as_str().to_owned())?;
    let key = match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => &value[7..],
        _ => &value[..],
    };
    Some(key.to_owned())
}

/// Maps an error to its peer-visible rendering. Cryptographic rejections are
/// deliberately uniform so the wire carries no oracle; the distinct cause is
/// already in the logs.
fn peer_error(err: &RkiError) -> (u16, String) {
    match err {
        RkiError::UnknownTerminal(id) => error_body(404, &format!("unknown terminal: {id}")),
        RkiError::TerminalConflict(id) => error_body(
            409,
            &format!("terminal {id} is already registered with a different public key"),
        ),
        RkiError::MalformedMessage(detail) => error_body(400, &format!("malformed message: {detail}")),
        RkiError::NotAuthorized => error_body(401, "not authorized to perform this action"),
        RkiError::KsnConflict(_) => {
            error_body(409, "a concurrent key request for this terminal won; retry")
        }
        RkiError::UpstreamUnavailable(_) => error_body(502, "upstream dependency unavailable"),
        RkiError::SignatureInvalid
        | RkiError::NonceMismatch
        | RkiError::DecryptionFailed
        | RkiError::Crypto(_) => error_body(400, "request rejected"),
        RkiError::KeyStoreCorrupt(_) | RkiError::Storage(_) => error_body(500, "internal error"),
    }
}

fn error_body(status: u16, message: &str) -> (u16, String) {
    let body = types::to_json(&ErrorResponse {
        error: message.to_owned(),
    })
    .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_owned());
    (status, body)
}
