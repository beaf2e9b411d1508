pub const BINARY_NAME: &str = "stackforge";

pub const RUNTIME_SUBTREES: [&str; 3] = ["lib", "generators", "templates"];

pub const REQUIRED_SUBTREE: &str = "lib";

pub fn binary_file_name() -> String {
    if cfg!(windows) {
        format!("{BINARY_NAME}.exe")
    } else {
        BINARY_NAME.to_string()
    }
}
