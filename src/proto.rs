//! Generated gRPC client stubs, compiled by `build.rs` from the `.proto`
//! files under `proto/`.

/// TGIS-style generation service (`proto/generation.proto`).
pub mod generation {
    tonic::include_proto!("generation");
}

/// Caikit NLP runtime text-generation task (`proto/caikit_text_generation.proto`).
pub mod caikit_nlp {
    tonic::include_proto!("caikit.runtime.nlp");
}
