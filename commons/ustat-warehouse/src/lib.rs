mod error;
pub mod memory;
pub mod overlay;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod traits;

pub use error::{WarehouseError, WarehouseResult};
pub use memory::MemoryWarehouse;
pub use overlay::OverlayWarehouse;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteWarehouse;
pub use traits::{DimensionRow, SurrogateKey, Warehouse};
