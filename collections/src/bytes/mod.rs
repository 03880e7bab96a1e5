pub mod cursor;
pub mod rc;

pub use cursor::Cursor;
