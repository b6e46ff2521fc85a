//! Control-plane router (component J, routing half). Auth is applied as a
//! layer by the caller in `main.rs`, not nested here, so a single
//! `hmac_auth_middleware` instance guards every route below `/projects`.

pub mod projects;
