use rustc_version::{Channel, version_meta};

fn main()
{
	// Statically link the VC runtime on Windows MSVC builds, no-op elsewhere
	static_vcruntime::metabuild();

	// If detect-backtrace is enabled (default), detect if we're on nightly or not.
	// If we're on nightly, enable backtraces automatically.
	if std::env::var_os("CARGO_FEATURE_DETECT_BACKTRACE").is_some() {
		match version_meta() {
			Ok(version_meta) => {
				if version_meta.channel == Channel::Nightly {
					println!("cargo:rustc-cfg=feature=\"backtrace\"");
				}
			},
			Err(e) => {
				println!("cargo:warning=error detecting rustc version: {}", e);
			},
		}
	}
}
