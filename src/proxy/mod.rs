//! Reverse proxy + injector (H) and HMR WebSocket splicer (G) for the
//! public-facing `/p/<id>/*` and `/hmr*` surfaces.

pub mod hmr;
pub mod http;

pub use hmr::{hmr_handler, HmrBroker};
pub use http::{proxy_handler_tail, redirect_trailing_slash};
