//! Pool file catalog writer.
//!
//! The payload locates its inputs through a small XML catalog mapping each
//! file's GUID to the transfer URL. Written pretty-printed with two-space
//! indentation and the `InMemory` DOCTYPE the payload framework expects.

use std::path::Path;

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::filespec::FileSpec;

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the catalog document for `files`.
pub fn render_pool_file_catalog(files: &[FileSpec]) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" ?>\n");
    xml.push_str("<!DOCTYPE POOLFILECATALOG SYSTEM \"InMemory\">\n");
    xml.push_str("<POOLFILECATALOG>\n");
    for fspec in files {
        xml.push_str(&format!("  <File ID=\"{}\">\n", escape_attr(&fspec.guid)));
        xml.push_str("    <physical>\n");
        xml.push_str(&format!(
            "      <pfn filetype=\"ROOT_All\" name=\"{}\"/>\n",
            escape_attr(&fspec.turl)
        ));
        xml.push_str("    </physical>\n");
        xml.push_str("    <logical/>\n");
        xml.push_str("  </File>\n");
    }
    xml.push_str("</POOLFILECATALOG>\n");
    xml
}

/// Write the catalog for `files` to `path`.
pub fn write_pool_file_catalog(files: &[FileSpec], path: &Path) -> Result<(), PilotError> {
    std::fs::write(path, render_pool_file_catalog(files)).map_err(|err| {
        PilotError::new(ErrorCode::FileHandlingFailure)
            .with_kwarg("reason", format!("write {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_contains_doctype_guid_and_turl() {
        let mut fspec = FileSpec::new("mc16", "a.root");
        fspec.guid = "8f2a1c".to_string();
        fspec.turl = "root://host/a.root".to_string();

        let xml = render_pool_file_catalog(&[fspec]);
        assert!(xml.starts_with("<?xml version=\"1.0\" ?>\n<!DOCTYPE POOLFILECATALOG SYSTEM \"InMemory\">"));
        assert!(xml.contains("  <File ID=\"8f2a1c\">"));
        assert!(xml.contains("      <pfn filetype=\"ROOT_All\" name=\"root://host/a.root\"/>"));
        assert!(xml.contains("    <logical/>"));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let mut fspec = FileSpec::new("mc16", "a.root");
        fspec.guid = "g\"uid".to_string();
        fspec.turl = "https://host/a?x=1&y=<2>".to_string();

        let xml = render_pool_file_catalog(&[fspec]);
        assert!(xml.contains("ID=\"g&quot;uid\""));
        assert!(xml.contains("name=\"https://host/a?x=1&amp;y=&lt;2&gt;\""));
    }

    #[test]
    fn write_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PoolFileCatalog.xml");
        write_pool_file_catalog(&[FileSpec::new("mc16", "a.root")], &path).unwrap();
        assert!(path.is_file());
    }
}
