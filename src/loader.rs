//! Report discovery and decompression.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Xml,
    Gzip,
    Zip,
}

impl ReportFormat {
    /// Format from the file name: `.xml`, `.xml.gz`/`.gz`, `.zip`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".xml") {
            Some(ReportFormat::Xml)
        } else if name.ends_with(".gz") {
            Some(ReportFormat::Gzip)
        } else if name.ends_with(".zip") {
            Some(ReportFormat::Zip)
        } else {
            None
        }
    }
}

/// Candidate report files: the file itself, or the directory's direct
/// children with a known extension, sorted by path.
pub fn discover_report_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let candidate = entry.path();
        if candidate.is_file() && ReportFormat::from_path(&candidate).is_some() {
            files.push(candidate);
        } else {
            log::debug!("Ignoring {}", candidate.display());
        }
    }
    files.sort();
    Ok(files)
}

/// Raw XML bytes of a report file.
pub fn read_report(path: &Path) -> Result<Vec<u8>, LoadError> {
    let io_error = |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let format = ReportFormat::from_path(path).ok_or_else(|| LoadError::Unsupported {
        path: path.to_path_buf(),
    })?;
    let file = File::open(path).map_err(io_error)?;
    let mut bytes = Vec::new();

    match format {
        ReportFormat::Xml => {
            let mut file = file;
            file.read_to_end(&mut bytes).map_err(io_error)?;
        }
        ReportFormat::Gzip => {
            GzDecoder::new(file)
                .read_to_end(&mut bytes)
                .map_err(io_error)?;
        }
        ReportFormat::Zip => {
            let zip_error = |source| LoadError::Zip {
                path: path.to_path_buf(),
                source,
            };
            let mut archive = zip::ZipArchive::new(file).map_err(zip_error)?;
            let index = (0..archive.len())
                .find(|&i| {
                    archive
                        .by_index(i)
                        .map(|entry| entry.name().to_ascii_lowercase().ends_with(".xml"))
                        .unwrap_or(false)
                })
                .ok_or_else(|| LoadError::EmptyArchive {
                    path: path.to_path_buf(),
                })?;
            let mut entry = archive.by_index(index).map_err(zip_error)?;
            log::debug!("Reading {} from {}", entry.name(), path.display());
            entry.read_to_end(&mut bytes).map_err(io_error)?;
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    const XML: &str = "<feedback></feedback>";

    fn write_gz(path: &Path, contents: &str) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        encoder.write_all(contents.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ReportFormat::from_path(Path::new("a.XML")), Some(ReportFormat::Xml));
        assert_eq!(
            ReportFormat::from_path(Path::new("google.com!example.com!1!2.xml.gz")),
            Some(ReportFormat::Gzip)
        );
        assert_eq!(ReportFormat::from_path(Path::new("r.zip")), Some(ReportFormat::Zip));
        assert_eq!(ReportFormat::from_path(Path::new("notes.txt")), None);
    }

    #[test]
    fn test_discover_is_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        for name in ["b.xml", "a.xml.gz", "c.zip", "readme.txt"] {
            File::create(dir.path().join(name)).unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.xml")).unwrap();

        let files = discover_report_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.xml.gz", "b.xml", "c.zip"]);
    }

    #[test]
    fn test_discover_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.xml");
        std::fs::write(&path, XML).unwrap();
        assert_eq!(discover_report_files(&path).unwrap(), vec![path]);
    }

    #[test]
    fn test_read_plain_gzip_and_zip() {
        let dir = TempDir::new().unwrap();

        let xml = dir.path().join("r.xml");
        std::fs::write(&xml, XML).unwrap();
        assert_eq!(read_report(&xml).unwrap(), XML.as_bytes());

        let gz = dir.path().join("r.xml.gz");
        write_gz(&gz, XML);
        assert_eq!(read_report(&gz).unwrap(), XML.as_bytes());

        let zip = dir.path().join("r.zip");
        write_zip(&zip, &[("README", "ignored"), ("report.xml", XML)]);
        assert_eq!(read_report(&zip).unwrap(), XML.as_bytes());
    }

    #[test]
    fn test_read_errors() {
        let dir = TempDir::new().unwrap();

        let empty_zip = dir.path().join("empty.zip");
        write_zip(&empty_zip, &[("README", "no reports here")]);
        assert!(matches!(read_report(&empty_zip), Err(LoadError::EmptyArchive { .. })));

        let bogus_zip = dir.path().join("bogus.zip");
        std::fs::write(&bogus_zip, "not a zip").unwrap();
        assert!(matches!(read_report(&bogus_zip), Err(LoadError::Zip { .. })));

        let bogus_gz = dir.path().join("bogus.gz");
        std::fs::write(&bogus_gz, "not gzip").unwrap();
        assert!(matches!(read_report(&bogus_gz), Err(LoadError::Io { .. })));

        assert!(matches!(
            read_report(&dir.path().join("missing.xml")),
            Err(LoadError::Io { .. })
        ));
        assert!(matches!(
            read_report(Path::new("notes.txt")),
            Err(LoadError::Unsupported { .. })
        ));
    }
}
