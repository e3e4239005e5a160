use crate::correspondence::CandidateImage;
use crate::error::{MatchingError, Result};
use crate::params::SearchParams;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Bumped whenever the layout of the detailed dump changes.
pub const DETAIL_VERSION: &str = "2";

fn hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value);
    format!("{:x}", hasher.finalize())
}

/// Cache identity of one cell, or of a group of cells searched as one.
pub fn cell_id(cells: &[PathBuf]) -> String {
    let names: Vec<String> = cells
        .iter()
        .map(|c| {
            c.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| c.to_string_lossy().into_owned())
        })
        .collect();
    match names.as_slice() {
        [single] => single.clone(),
        _ => format!("cells-{}", &hash(&names.join("+"))[0..20]),
    }
}

/// File name of the cached index of `cells`. The name only covers the
/// parameters that shape the index, so changing anything else reuses it.
pub fn index_file_name(cells: &[PathBuf], criteria: Option<&str>, params: &SearchParams) -> String {
    let criteria = criteria.map(|c| format!("-{}", c)).unwrap_or_default();
    format!(
        "{}{}-{}.{}.index",
        cell_id(cells),
        criteria,
        params.index_type(),
        params.descriptor.dtype_name()
    )
}

pub fn dump_path(outfile: &Path) -> PathBuf {
    let mut name = outfile.as_os_str().to_owned();
    name.push(format!("-detailed{}.json", DETAIL_VERSION));
    PathBuf::from(name)
}

/// Writes `path` through a temporary sibling file that is renamed into
/// place once `write` succeeded, so readers never see a partial file.
pub fn save_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| MatchingError::io(&dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let rand_idx: u64 = rand::thread_rng().gen();
    let temp = dir.join(format!(".{}.{:016x}.tmp", file_name, rand_idx));

    let result = File::create(&temp)
        .map_err(|e| MatchingError::io(&temp, e))
        .and_then(|file| {
            let mut out = BufWriter::new(file);
            write(&mut out)?;
            out.flush().map_err(|e| MatchingError::io(&temp, e))
        })
        .and_then(|_| fs::rename(&temp, path).map_err(|e| MatchingError::io(path, e)));

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

pub fn write_dump(path: &Path, ranked: &[CandidateImage]) -> Result<()> {
    save_atomic(path, |out| {
        serde_json::to_writer(out, ranked)?;
        Ok(())
    })
}

pub fn read_dump(path: &Path) -> Result<Vec<CandidateImage>> {
    let file = File::open(path).map_err(|e| MatchingError::io(path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// One `<votes>\t<image>` line per candidate, in ranking order.
pub fn write_summary(path: &Path, ranked: &[CandidateImage]) -> Result<()> {
    save_atomic(path, |out| {
        for candidate in ranked {
            writeln!(out, "{}\t{}", candidate.votes(), candidate.image)
                .map_err(|e| MatchingError::io(path, e))?;
        }
        Ok(())
    })
}

pub fn read_summary(path: &Path) -> Result<Vec<(usize, String)>> {
    let file = File::open(path).map_err(|e| MatchingError::io(path, e))?;
    let mut tally = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| MatchingError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, '\t');
        let votes = parts
            .next()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .ok_or_else(|| MatchingError::parse(path, format!("bad vote count in '{}'", line)))?;
        let image = parts
            .next()
            .ok_or_else(|| MatchingError::parse(path, format!("missing image in '{}'", line)))?;
        tally.push((votes as usize, image.to_owned()));
    }
    Ok(tally)
}
