use std::collections::BTreeMap;

use glob::Pattern;
use hca_domain::{base_name, ensure_trailing_slash};
use tracing::warn;

/// 排除规则，作用于不含目录的文件名
///
/// 含 `*`、`?`、`[` 的模式按 glob 匹配，其余按子串匹配，
/// 所以 `Experiment.csv` 也会排除 `MyExpt_Experiment.csv`。
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    globs: Vec<Pattern>,
    fragments: Vec<String>,
}

impl ExclusionRules {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains(['*', '?', '[']) {
                match Pattern::new(pattern) {
                    Ok(glob) => {
                        rules.globs.push(glob);
                        continue;
                    }
                    Err(e) => warn!("排除模式 {} 不是合法的 glob，按子串匹配: {}", pattern, e),
                }
            }
            if !rules.fragments.iter().any(|f| f == pattern) {
                rules.fragments.push(pattern.to_string());
            }
        }
        rules
    }

    pub fn is_excluded(&self, file_name: &str) -> bool {
        self.globs.iter().any(|glob| glob.matches(file_name))
            || self
                .fragments
                .iter()
                .any(|fragment| file_name.contains(fragment.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty() && self.fragments.is_empty()
    }
}

/// 从任务记录目录的递归列举结果中挑出待合并的结果文件
#[derive(Debug, Clone)]
pub struct ResultSelection {
    root: String,
    suffix: String,
    exclusions: ExclusionRules,
}

impl ResultSelection {
    const OUTPUT_SEGMENT: &'static str = "output";

    /// `root` 为子任务记录前缀，其下一层是孔目录；`extension` 不带点，例如 `csv`
    pub fn new(root: &str, extension: &str, exclusions: ExclusionRules) -> Self {
        Self {
            root: ensure_trailing_slash(root),
            suffix: format!(".{}", extension.trim_start_matches('.')),
            exclusions,
        }
    }

    /// 只接受 `{root}{孔}/output/` 之下的文件，记录前缀本身的路径段不参与判断
    pub fn accepts(&self, key: &str) -> bool {
        let Some(relative) = key.strip_prefix(&self.root) else {
            return false;
        };
        let segments: Vec<&str> = relative.split('/').collect();
        let file_name = base_name(relative);
        segments.len() >= 3
            && segments[1] == Self::OUTPUT_SEGMENT
            && file_name.ends_with(&self.suffix)
            && !self.exclusions.is_excluded(file_name)
    }

    /// 按文件名分组，组内按键排序
    pub fn group(&self, keys: &[String]) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in keys.iter().filter(|key| self.accepts(key)) {
            groups
                .entry(base_name(key).to_string())
                .or_default()
                .push(key.clone());
        }
        for members in groups.values_mut() {
            members.sort();
        }
        groups
    }
}
