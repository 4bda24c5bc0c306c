pub mod embedding;
pub mod face_analyzer;
pub mod gallery;
pub mod identity_store;
pub mod match_result;
pub mod recognition_engine;
