mod checksum;
mod fetch;
mod source;

pub use checksum::{parse_checksum_text, sha256_file_hex, sha256_hex_reader, verify_sha256_file};
pub use fetch::{fetch_release, stage_unpacked_release, FetchedRelease};
pub use source::{
    expand_url_template, host_target_triple, parse_release_listing, HttpReleaseSource,
    HttpSourceConfig, LocalReleaseSource, ReleaseSource, ARCHIVE_FILE_NAME, CHECKSUM_FILE_NAME,
};
