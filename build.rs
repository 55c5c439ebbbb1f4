fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the checked-in pre-generated output when protoc is not
    // installed, so offline environments can still build.
    match tonic_build::compile_protos("proto/livecast.proto") {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let out_dir = std::env::var("OUT_DIR")?;
            std::fs::copy(
                "proto/livecast.rs",
                std::path::Path::new(&out_dir).join("livecast.rs"),
            )?;
        }
        Err(err) => return Err(err.into()),
    }

    // encoder termination relies on unix signals and pkill
    if std::env::consts::OS != "linux" {
        panic!("This program only runs on linux");
    }
    Ok(())
}
