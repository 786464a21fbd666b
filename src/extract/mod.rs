pub mod scenes;

pub use scenes::SceneExtractor;
