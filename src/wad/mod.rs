pub mod level;
mod udmf;
pub mod wad;

pub use level::{LevelError, LevelGeometry, MapFormat};
pub use wad::{Wad, WadError, WadKind, XwaWriter};
