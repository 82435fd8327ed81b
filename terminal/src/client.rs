// SPDX-License-Identifier:

//! Terminal role driver: durable identity and registration state plus the
//! HTTP transport. All protocol logic lives in `rki-protocol`.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use ureq::Agent;

use rki_protocol::types::{
    from_json, to_json, ErrorResponse, KeyInjectionResponse, KeyMaterialResult,
    RegisterTerminalRequest, RegisterTerminalResponse,
};
use rki_protocol::{flow, identity, Identity};

pub const REGISTER_ROUTE: &str = "/p2pe/register-terminal-for-remote-key-injection";
pub const KEY_ROUTE: &str = "/p2pe/get-key-from-registered-terminal-for-remote-key-injection";

/// What the terminal persists after a successful registration: the service's
/// public key and the KSN the service assigned. Never holds key material.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RegistrationState {
    service_public_key_pem: String,
    full_ksn: String,
}

pub struct TerminalClient {
    terminal_id: String,
    api_key: String,
    service_url: String,
    state_path: PathBuf,
    identity: Identity,
    registration: Option<RegistrationState>,
    agent: Agent,
}

impl TerminalClient {
    pub fn new(
        terminal_id: &str,
        api_key: &str,
        service_url: &str,
        state_dir: &Path,
    ) -> Result<Self> {
        let key_path = state_dir.join(format!("{terminal_id}_private_key.pem"));
        let identity = Identity::load_or_generate(&key_path)?;

        let state_path = state_dir.join(format!("{terminal_id}_state.json"));
        let registration = match fs::read_to_string(&state_path) {
            Ok(raw) => Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt terminal state: {}", state_path.display()))?,
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        // non-2xx replies carry an error body worth reading, so keep them
        // out of the transport error path
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();

        Ok(Self {
            terminal_id: terminal_id.to_owned(),
            api_key: api_key.to_owned(),
            service_url: service_url.trim_end_matches('/').to_owned(),
            state_path,
            identity,
            registration,
            agent,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Registration flow, terminal side. The request is unsigned: no shared
    /// trust exists yet, the bearer api key vouches for the caller. The
    /// service's public key and the assigned KSN are persisted before this
    /// returns.
    pub fn register(&mut self) -> Result<()> {
        let request = RegisterTerminalRequest {
            terminal_id: self.terminal_id.clone(),
            public_key_pem: self.identity.export_public_pem()?,
        };
        let (status, body) = self.post_json(REGISTER_ROUTE, &to_json(&request)?)?;
        if status != 200 {
            bail!("registration failed: {}", error_text(status, &body));
        }

        let response: RegisterTerminalResponse = from_json(&body)?;
        // parse eagerly so a bad service key is caught at registration time
        identity::public_key_from_pem(&response.service_public_key_pem)?;

        let state = RegistrationState {
            service_public_key_pem: response.service_public_key_pem,
            full_ksn: response.full_ksn,
        };
        self.persist_state(&state)?;
        info!(terminal_id = %self.terminal_id, ksn = %state.full_ksn, "terminal registered");
        self.registration = Some(state);
        Ok(())
    }

    /// Key-request flow, terminal side: signed and nonced request out,
    /// verified, nonce-checked and unwrapped response in. The stored KSN is
    /// advanced to the issued one only after the full chain succeeds.
    pub fn request_key(&mut self) -> Result<KeyMaterialResult> {
        let registration = self
            .registration
            .as_ref()
            .ok_or_else(|| anyhow!("terminal {} is not registered yet", self.terminal_id))?;
        let service_public = identity::public_key_from_pem(&registration.service_public_key_pem)?;

        let pending =
            flow::build_key_request(&self.identity, &self.terminal_id, &registration.full_ksn)?;
        let (status, body) = self.post_json(KEY_ROUTE, &to_json(&pending.request)?)?;
        if status != 200 {
            bail!("key request failed: {}", error_text(status, &body));
        }

        let response: KeyInjectionResponse = from_json(&body)?;
        let result =
            flow::accept_key_response(&self.identity, &service_public, &pending.nonce, &response)?;

        let state = RegistrationState {
            service_public_key_pem: registration.service_public_key_pem.clone(),
            full_ksn: result.ksn.clone(),
        };
        self.persist_state(&state)?;
        self.registration = Some(state);
        Ok(result)
    }

    fn persist_state(&self, state: &RegistrationState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.state_path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }

    fn post_json(&self, route: &str, body: &str) -> Result<(u16, String)> {
        let url = format!("{}{}", self.service_url, route);
        let mut resp = self
            .agent
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .content_type("application/json")
            .send(body)?;
        let status = resp.status().as_u16();
        let mut out = String::new();
        resp.body_mut().as_reader().read_to_string(&mut out)?;
        Ok((status, out))
    }
}

fn error_text(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(reply) => format!("{} ({status})", reply.error),
        Err(_) => format!("status {status}"),
    }
}
