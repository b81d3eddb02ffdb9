mod awbwreplay;
pub mod config;
mod error;
pub mod game_constants;
pub mod model;
pub mod replay;
pub mod types;
pub mod wire;

pub use awbwreplay::*;
pub use config::{ParserConfig, ParserConfigBuilder};
pub use error::*;
pub use game_constants::GameConstants;
pub use strum;

#[cfg(feature = "arc")]
pub type Rc<T> = std::sync::Arc<T>;

#[cfg(not(feature = "arc"))]
pub type Rc<T> = std::rc::Rc<T>;
