// SPDX-License-Identifier:

//! Service-side halves of the registration and key-request flows.

use tracing::{debug, info, warn};

use rki_protocol::types::{
    KeyInjectionRequest, KeyInjectionResponse, RegisterTerminalRequest, RegisterTerminalResponse,
};
use rki_protocol::{flow, identity, Identity, RkiError};

use crate::registry::Registry;
use crate::upstream::{CallerAuthorization, CallerIdentity, KeyDerivation};

pub struct ServiceState {
    pub identity: Identity,
    pub registry: Registry,
    pub authorization: Box<dyn CallerAuthorization>,
    pub derivation: Box<dyn KeyDerivation>,
}

impl ServiceState {
    /// Resolves the caller before either flow is accepted.
    pub fn authorize_caller(&self, api_key: &str) -> Result<CallerIdentity, RkiError> {
        self.authorization.authorize(api_key)
    }

    /// Registration flow, service side: bind the terminal's public key and
    /// hand back our own public key plus the assigned KSN seed.
    pub fn register_terminal(
        &self,
        caller: &CallerIdentity,
        request: &RegisterTerminalRequest,
    ) -> Result<RegisterTerminalResponse, RkiError> {
        // reject garbage before it can enter the registry
        identity::public_key_from_pem(&request.public_key_pem)?;

        let full_ksn = self
            .registry
            .register(&request.terminal_id, &request.public_key_pem)?;
        info!(
            terminal_id = %request.terminal_id,
            merchant_id = %caller.merchant_id,
            "registration accepted"
        );
        Ok(RegisterTerminalResponse {
            service_public_key_pem: self.identity.export_public_pem()?,
            full_ksn,
        })
    }

    /// Key-request flow, service side: lookup, verify, derive, wrap, sign,
    /// and only then advance the KSN. The advancement is a compare-and-swap
    /// against the KSN this issuance derived from, so concurrent requests
    /// from the same terminal can never both be issued the same KSN: the
    /// loser aborts whole. Any failure aborts with no state change.
    pub fn issue_key(
        &self,
        caller: &CallerIdentity,
        request: &KeyInjectionRequest,
    ) -> Result<KeyInjectionResponse, RkiError> {
        let record = self.registry.lookup(&request.terminal_id)?;
        let terminal_public = identity::public_key_from_pem(&record.public_key_pem)
            .map_err(|_| RkiError::KeyStoreCorrupt(format!("terminal {}", request.terminal_id)))?;

        flow::verify_key_request(&terminal_public, request)?;

        // the service is KSN-authoritative; a stale KSN in the request is
        // served against the stored one
        if request.full_ksn != record.current_ksn {
            debug!(
                terminal_id = %request.terminal_id,
                requested = %request.full_ksn,
                current = %record.current_ksn,
                "request carries a stale KSN"
            );
        }

        let derived = self
            .derivation
            .derive_ipek(&request.terminal_id, &record.current_ksn)?;
        let response =
            flow::issue_key_response(&self.identity, &terminal_public, &request.nonce, &derived)?;

        if let Err(e) =
            self.registry
                .advance_ksn(&request.terminal_id, &record.current_ksn, &derived.ksn)
        {
            warn!(terminal_id = %request.terminal_id, error = %e, "KSN advancement failed");
            return Err(e);
        }
        info!(
            terminal_id = %request.terminal_id,
            merchant_id = %caller.merchant_id,
            ksn = %derived.ksn,
            request_id = %response.request_id,
            "key issued"
        );
        Ok(response)
    }
}
