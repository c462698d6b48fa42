pub mod mesh;
pub mod sandbox;
pub mod users;
pub mod utils;
