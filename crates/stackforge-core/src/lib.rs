mod names;
mod version;

pub use names::{binary_file_name, BINARY_NAME, REQUIRED_SUBTREE, RUNTIME_SUBTREES};
pub use version::{compare, resolve_latest, MalformedVersion, Version};

#[cfg(test)]
mod tests;
