//! Job identity, metadata manifest and result verdict.
//!
//! A job directory is named `{serial}_{timestamp}` and holds exactly one XML
//! metadata file. The manifest is read as a flat map of leaf elements:
//!
//! ```xml
//! <Job>
//!   <UnitNumber>U-17</UnitNumber>
//!   <ModelerName>ModelA</ModelerName>
//!   <NumFilesConsumed>2</NumFilesConsumed>
//!   <NumFilesProduced>1</NumFilesProduced>
//!   <NumFilesToTransfer>1</NumFilesToTransfer>
//!   <TransferFile1>report.pdf</TransferFile1>
//! </Job>
//! ```
//!
//! The worker's results file is read the same way and carries the verdict in
//! `OverallResult`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::control::{EngineControl, Shutdown};

const XML_EXTENSION: &str = "xml";

pub const KEY_UNIT_NUMBER: &str = "UnitNumber";
pub const KEY_MODELER_NAME: &str = "ModelerName";
pub const KEY_FILES_CONSUMED: &str = "NumFilesConsumed";
pub const KEY_FILES_PRODUCED: &str = "NumFilesProduced";
pub const KEY_FILES_TO_TRANSFER: &str = "NumFilesToTransfer";
pub const KEY_TRANSFER_FILE_PREFIX: &str = "TransferFile";
pub const KEY_OVERALL_RESULT: &str = "OverallResult";

/// Metadata and results errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Job directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed XML in {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },

    #[error("{path} is missing required field '{field}'")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("{path} has invalid value '{value}' for '{field}'")]
    InvalidField {
        path: PathBuf,
        field: &'static str,
        value: String,
    },

    #[error("Interrupted by shutdown")]
    Shutdown(#[from] Shutdown),
}

// =============================================================================
// Job identity
// =============================================================================

/// Immutable identity of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Directory name, unique across the buffer tree
    pub name: String,
    /// Prefix before the first `_`
    pub serial: String,
    /// Suffix after the first `_`, empty if the name has none
    pub timestamp: String,
    /// Directory the job was found in
    pub source_dir: PathBuf,
    /// File name of the metadata file inside `source_dir`
    pub metadata_file: String,
}

impl JobDescriptor {
    pub fn new(name: &str, source_dir: PathBuf, metadata_file: String) -> Self {
        let (serial, timestamp) = split_job_name(name);
        Self {
            name: name.to_string(),
            serial: serial.to_string(),
            timestamp: timestamp.to_string(),
            source_dir,
            metadata_file,
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.source_dir.join(&self.metadata_file)
    }
}

/// Splits `{serial}_{timestamp}` on the first underscore.
pub fn split_job_name(name: &str) -> (&str, &str) {
    name.split_once('_').unwrap_or((name, ""))
}

// =============================================================================
// Manifest
// =============================================================================

/// Requirements declared by a job's metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManifest {
    pub unit_number: Option<String>,
    pub modeler_name: String,
    pub files_consumed: usize,
    pub files_produced: usize,
    pub transfer_files: Vec<String>,
}

impl JobManifest {
    /// Reads and parses a metadata file.
    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let fields = read_leaf_fields(path)?;
        Self::from_fields(path, &fields)
    }

    fn from_fields(path: &Path, fields: &HashMap<String, String>) -> Result<Self, MetadataError> {
        let required = |field: &'static str| {
            fields
                .get(field)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| MetadataError::MissingField {
                    path: path.to_path_buf(),
                    field,
                })
        };
        let count = |field: &'static str, value: &str| {
            value
                .parse::<usize>()
                .map_err(|_| MetadataError::InvalidField {
                    path: path.to_path_buf(),
                    field,
                    value: value.to_string(),
                })
        };

        let modeler_name = required(KEY_MODELER_NAME)?.to_string();
        let files_consumed = count(KEY_FILES_CONSUMED, required(KEY_FILES_CONSUMED)?)?;
        let files_produced = count(KEY_FILES_PRODUCED, required(KEY_FILES_PRODUCED)?)?;

        let transfer_files = match fields.get(KEY_FILES_TO_TRANSFER).map(|v| v.trim()) {
            Some(n) if !n.is_empty() => {
                let n = count(KEY_FILES_TO_TRANSFER, n)?;
                (1..=n)
                    .filter_map(|i| {
                        let key = format!("{KEY_TRANSFER_FILE_PREFIX}{i}");
                        let name = transfer_name(fields, &key);
                        if name.is_none() {
                            warn!(path = %path.display(), key = %key, "Declared transfer file missing");
                        }
                        name
                    })
                    .collect()
            }
            _ => (1..)
                .map(|i| transfer_name(fields, &format!("{KEY_TRANSFER_FILE_PREFIX}{i}")))
                .take_while(Option::is_some)
                .flatten()
                .collect(),
        };

        Ok(Self {
            unit_number: fields
                .get(KEY_UNIT_NUMBER)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            modeler_name,
            files_consumed,
            files_produced,
            transfer_files,
        })
    }

    /// Files the processing directory holds once the worker is done.
    pub fn files_expected_after_run(&self) -> usize {
        self.files_consumed + self.files_produced
    }
}

fn transfer_name(fields: &HashMap<String, String>, key: &str) -> Option<String> {
    fields
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// =============================================================================
// Results
// =============================================================================

/// Worker verdict from the results file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }
}

/// Reads the verdict. A missing file or a missing or non-`Pass`
/// `OverallResult` is a failure; an unreadable file is an error.
pub fn read_verdict(results_path: &Path) -> Result<Verdict, MetadataError> {
    if !results_path.exists() {
        debug!(path = %results_path.display(), "No results file, treating as fail");
        return Ok(Verdict::Fail);
    }
    let fields = read_leaf_fields(results_path)?;
    let verdict = match fields.get(KEY_OVERALL_RESULT) {
        Some(v) if v.trim().eq_ignore_ascii_case("pass") => Verdict::Pass,
        _ => Verdict::Fail,
    };
    Ok(verdict)
}

// =============================================================================
// XML
// =============================================================================

fn read_leaf_fields(path: &Path) -> Result<HashMap<String, String>, MetadataError> {
    let text = fs::read_to_string(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_leaf_fields(&text).map_err(|source| MetadataError::Xml {
        path: path.to_path_buf(),
        source,
    })
}

/// Collects `name -> text` for every element without child elements.
/// The first occurrence of a name wins.
pub(crate) fn parse_leaf_fields(xml: &str) -> Result<HashMap<String, String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    // Innermost open element that has not yet seen a child element.
    let mut open_leaf: Option<(String, String)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                open_leaf = Some((name, String::new()));
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                fields.entry(name).or_insert_with(String::new);
                open_leaf = None;
            }
            Event::Text(t) => {
                if let Some((_, text)) = open_leaf.as_mut() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some((_, text)) = open_leaf.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                if let Some((name, text)) = open_leaf.take() {
                    fields.entry(name).or_insert(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(fields)
}

// =============================================================================
// Locating and probing files
// =============================================================================

/// Returns the metadata file in `dir`: the `.xml` file whose name is not
/// `results_file`. If several qualify the first by name is used.
pub fn locate_metadata_file(dir: &Path, results_file: &str) -> io::Result<Option<String>> {
    let mut candidates: Vec<String> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| {
            Path::new(name)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(XML_EXTENSION))
                && !name.eq_ignore_ascii_case(results_file)
        })
        .collect();
    candidates.sort();
    if candidates.len() > 1 {
        warn!(dir = %dir.display(), count = candidates.len(), "Several metadata candidates, using first");
    }
    Ok(candidates.into_iter().next())
}

/// Polls `dir` until its metadata file appears.
pub async fn find_metadata_file(
    dir: &Path,
    results_file: &str,
    control: &EngineControl,
    granularity: Duration,
) -> Result<String, MetadataError> {
    loop {
        control.wait_while_paused().await?;
        if !dir.is_dir() {
            return Err(MetadataError::MissingDirectory(dir.to_path_buf()));
        }
        match locate_metadata_file(dir, results_file) {
            Ok(Some(name)) => return Ok(name),
            Ok(None) => trace!(dir = %dir.display(), "Metadata file not present yet"),
            Err(e) => debug!(dir = %dir.display(), error = %e, "Metadata scan failed, retrying"),
        }
        control.sleep(granularity).await?;
    }
}

/// Waits until `path` is non-empty and can be opened exclusively.
pub async fn wait_until_ready(
    path: &Path,
    control: &EngineControl,
    granularity: Duration,
) -> Result<(), MetadataError> {
    loop {
        control.wait_while_paused().await?;
        if is_ready(path) {
            return Ok(());
        }
        trace!(path = %path.display(), "File not ready yet");
        control.sleep(granularity).await?;
    }
}

/// True if `path` has content and no other process holds it open for
/// writing.
pub fn is_ready(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => try_exclusive_lock(path),
        _ => false,
    }
}

#[cfg(unix)]
fn try_exclusive_lock(path: &Path) -> bool {
    use std::os::unix::io::AsRawFd;

    let Ok(file) = File::open(path) else {
        return false;
    };
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid descriptor owned by `file` for this scope.
    let locked = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } == 0;
    if locked {
        // SAFETY: as above.
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
    locked
}

#[cfg(windows)]
fn try_exclusive_lock(path: &Path) -> bool {
    use std::os::windows::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .read(true)
        .share_mode(0)
        .open(path)
        .is_ok()
}

#[cfg(not(any(unix, windows)))]
fn try_exclusive_lock(path: &Path) -> bool {
    File::open(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Job>
  <UnitNumber>U-17</UnitNumber>
  <ModelerName>ModelA</ModelerName>
  <NumFilesConsumed>2</NumFilesConsumed>
  <NumFilesProduced>1</NumFilesProduced>
  <NumFilesToTransfer>2</NumFilesToTransfer>
  <TransferFile1>report.pdf</TransferFile1>
  <TransferFile2>summary &amp; notes.txt</TransferFile2>
</Job>"#;

    #[test]
    fn test_split_job_name() {
        assert_eq!(split_job_name("1278061_202006181549"), ("1278061", "202006181549"));
        assert_eq!(split_job_name("a_b_c"), ("a", "b_c"));
        assert_eq!(split_job_name("plain"), ("plain", ""));
    }

    #[test]
    fn test_descriptor_fields() {
        let d = JobDescriptor::new("1278061_202006181549", PathBuf::from("/in/1278061_202006181549"), "job.xml".into());
        assert_eq!(d.serial, "1278061");
        assert_eq!(d.timestamp, "202006181549");
        assert_eq!(d.metadata_path(), PathBuf::from("/in/1278061_202006181549/job.xml"));
    }

    #[test]
    fn test_parse_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.xml");
        fs::write(&path, MANIFEST).unwrap();

        let manifest = JobManifest::read(&path).unwrap();
        assert_eq!(manifest.unit_number.as_deref(), Some("U-17"));
        assert_eq!(manifest.modeler_name, "ModelA");
        assert_eq!(manifest.files_consumed, 2);
        assert_eq!(manifest.files_produced, 1);
        assert_eq!(manifest.files_expected_after_run(), 3);
        assert_eq!(manifest.transfer_files, vec!["report.pdf", "summary & notes.txt"]);
    }

    #[test]
    fn test_manifest_without_transfer_count_collects_sequence() {
        let fields = parse_leaf_fields(
            "<Job><ModelerName>M</ModelerName><NumFilesConsumed>1</NumFilesConsumed>\
             <NumFilesProduced>0</NumFilesProduced><TransferFile1>a</TransferFile1>\
             <TransferFile2>b</TransferFile2><TransferFile4>d</TransferFile4></Job>",
        )
        .unwrap();
        let manifest = JobManifest::from_fields(Path::new("m.xml"), &fields).unwrap();
        assert_eq!(manifest.transfer_files, vec!["a", "b"]);
        assert_eq!(manifest.unit_number, None);
    }

    #[test]
    fn test_manifest_missing_modeler() {
        let fields =
            parse_leaf_fields("<Job><NumFilesConsumed>1</NumFilesConsumed></Job>").unwrap();
        let err = JobManifest::from_fields(Path::new("m.xml"), &fields).unwrap_err();
        assert!(matches!(err, MetadataError::MissingField { field: KEY_MODELER_NAME, .. }));
    }

    #[test]
    fn test_manifest_invalid_count() {
        let fields = parse_leaf_fields(
            "<Job><ModelerName>M</ModelerName><NumFilesConsumed>two</NumFilesConsumed>\
             <NumFilesProduced>1</NumFilesProduced></Job>",
        )
        .unwrap();
        let err = JobManifest::from_fields(Path::new("m.xml"), &fields).unwrap_err();
        assert!(matches!(err, MetadataError::InvalidField { field: KEY_FILES_CONSUMED, .. }));
    }

    #[test]
    fn test_nested_elements_are_not_leaves() {
        let fields =
            parse_leaf_fields("<Root><Outer><Inner>x</Inner></Outer><Empty/></Root>").unwrap();
        assert_eq!(fields.get("Inner").map(String::as_str), Some("x"));
        assert_eq!(fields.get("Empty").map(String::as_str), Some(""));
        assert!(!fields.contains_key("Outer"));
        assert!(!fields.contains_key("Root"));
    }

    #[test]
    fn test_read_verdict() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Results.xml");

        assert_eq!(read_verdict(&path).unwrap(), Verdict::Fail);

        fs::write(&path, "<Results><OverallResult>pass</OverallResult></Results>").unwrap();
        assert_eq!(read_verdict(&path).unwrap(), Verdict::Pass);

        fs::write(&path, "<Results><OverallResult>Fail</OverallResult></Results>").unwrap();
        assert_eq!(read_verdict(&path).unwrap(), Verdict::Fail);

        fs::write(&path, "<Results><Other>Pass</Other></Results>").unwrap();
        assert_eq!(read_verdict(&path).unwrap(), Verdict::Fail);
    }

    #[test]
    fn test_read_verdict_malformed_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Results.xml");
        fs::write(&path, "<Results><OverallResult>Pass</Wrong></Results>").unwrap();
        assert!(matches!(read_verdict(&path), Err(MetadataError::Xml { .. })));
    }

    #[test]
    fn test_locate_metadata_skips_results_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Results.xml"), "<r/>").unwrap();
        fs::write(dir.path().join("data.bin"), "x").unwrap();
        assert_eq!(locate_metadata_file(dir.path(), "Results.xml").unwrap(), None);

        fs::write(dir.path().join("job.XML"), "<j/>").unwrap();
        assert_eq!(
            locate_metadata_file(dir.path(), "Results.xml").unwrap().as_deref(),
            Some("job.XML")
        );
    }

    #[test]
    fn test_is_ready_requires_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.xml");
        assert!(!is_ready(&path));
        fs::write(&path, "").unwrap();
        assert!(!is_ready(&path));
        fs::write(&path, "<j/>").unwrap();
        assert!(is_ready(&path));
    }

    #[tokio::test]
    async fn test_find_metadata_waits_for_file() {
        let dir = TempDir::new().unwrap();
        let control = EngineControl::new();
        let target = dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(target.join("job.xml"), MANIFEST).unwrap();
        });

        let name = tokio::time::timeout(
            Duration::from_secs(5),
            find_metadata_file(dir.path(), "Results.xml", &control, Duration::from_millis(10)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(name, "job.xml");
    }

    #[tokio::test]
    async fn test_find_metadata_returns_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let control = EngineControl::new();
        control.shutdown();
        let result =
            find_metadata_file(dir.path(), "Results.xml", &control, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(MetadataError::Shutdown(_))));
    }

    #[tokio::test]
    async fn test_find_metadata_missing_directory() {
        let dir = TempDir::new().unwrap();
        let control = EngineControl::new();
        let result = find_metadata_file(
            &dir.path().join("gone"),
            "Results.xml",
            &control,
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(MetadataError::MissingDirectory(_))));
    }
}
