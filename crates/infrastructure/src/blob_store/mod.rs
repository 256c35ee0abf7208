mod in_memory;
mod local_fs;

pub use in_memory::InMemoryBlobStore;
pub use local_fs::LocalFsBlobStore;

use std::collections::BTreeSet;

use hca_domain::ListResult;

/// 按 `/` 分隔符把 `prefix` 下的键整理为列举结果
fn build_listing<'a, I>(prefix: &str, keys: I, recursive: bool) -> ListResult
where
    I: IntoIterator<Item = &'a str>,
{
    let mut dirs = BTreeSet::new();
    let mut files = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if recursive {
            files.push(key.to_string());
            continue;
        }
        match rest.split_once('/') {
            Some((dir, _)) => {
                dirs.insert(format!("{prefix}{dir}/"));
            }
            None => files.push(key.to_string()),
        }
    }
    files.sort();
    ListResult {
        dirs: dirs.into_iter().collect(),
        files,
    }
}
