fn main() {
    // Only link OpenCL when the accelerated backend is compiled in
    if std::env::var_os("CARGO_FEATURE_GPU").is_some() {
        if let Ok(dir) = std::env::var("OPENCL_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", dir);
        }
        println!("cargo:rustc-link-lib=OpenCL");
    }
    println!("cargo:rerun-if-env-changed=OPENCL_LIB_DIR");
}
