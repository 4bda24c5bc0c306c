pub mod directory_identity_store;
pub mod execution_provider;
pub mod gallery_builder;
pub mod onnx_face_analyzer;
