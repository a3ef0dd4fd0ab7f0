fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The caikit HTTP transport reuses these two gRPC response messages as
    // JSON response bodies (`caikit.rs`'s `execute_http_unary`/
    // `execute_http_streaming`), so they need `serde::Deserialize` in
    // addition to the `prost::Message` impl tonic-prost-build generates by
    // default.
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .type_attribute(
            "caikit.runtime.nlp.GeneratedTextResult",
            "#[derive(serde::Deserialize)]",
        )
        .type_attribute(
            "caikit.runtime.nlp.GeneratedTextStreamResult",
            "#[derive(serde::Deserialize)]",
        )
        .compile_protos(
            &["proto/generation.proto", "proto/caikit_text_generation.proto"],
            &["proto"],
        )?;
    Ok(())
}
