use matching::{cell_id, image_name, SearchParams};
use std::path::{Path, PathBuf};

pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("placematch-cache")
}

/// Name of a query without its descriptor suffix.
pub fn query_name(query: &Path, params: &SearchParams) -> String {
    let file_name = query
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();
    match image_name(&file_name, params.descriptor) {
        Some(name) => name.to_owned(),
        None => query
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned(),
    }
}

/// Summary file of one query against one group of cells.
pub fn result_path(out_dir: &Path, query: &Path, cells: &[PathBuf], params: &SearchParams) -> PathBuf {
    out_dir.join(format!(
        "{},{},{}.res",
        query_name(query, params),
        cell_id(cells),
        params.search_type()
    ))
}
