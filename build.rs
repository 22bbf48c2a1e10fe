fn main() {
    // Link against the system libopus. The decoder/encoder bindings in
    // src/codec/ffi.rs declare the functions we use.
    println!("cargo:rustc-link-lib=opus");
}
