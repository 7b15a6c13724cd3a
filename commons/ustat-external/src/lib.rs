mod error;
pub mod fixture;
pub mod http;
mod traits;
mod types;

pub use error::{ExternalError, ExternalResult};
pub use fixture::{DirectoryFixture, StaticDirectory};
pub use http::{HttpDirectory, HttpDirectoryConfig};
pub use traits::{IdentityService, SourceSystem};
pub use types::*;
