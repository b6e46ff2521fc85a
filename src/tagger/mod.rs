//! Component B: the Tag-Injecting Transform, its id scheme, and the
//! in-process hosting of its three query endpoints (`/__jsx-*`).

pub mod id;
pub mod map;
pub mod transform;

pub use id::{generate_stable_id, is_valid_id, parse_id};
pub use map::{JsxLocation, SourceMapManager};
pub use transform::{should_process, transform_source, TaggerConfig, TransformResult};
