// SPDX-License-Identifier:

//! Key-issuing service role: terminal registry, upstream collaborators and
//! the service-side halves of the registration and key-request flows. The
//! binary in `main.rs` only adds the HTTP front end.

pub mod handlers;
pub mod registry;
pub mod upstream;
