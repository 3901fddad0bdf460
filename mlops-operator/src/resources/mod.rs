pub(crate) mod deployment;
pub(crate) mod endpoint;
pub(crate) mod endpoint_config;
pub(crate) mod gateway;
pub(crate) mod model;
pub(crate) mod service;
pub(crate) mod storage;
pub(crate) mod virtual_service;

/// Physical object name of a versioned resource
pub(crate) fn named_version(name: &str, version: &str) -> String {
    if version.is_empty() {
        name.to_owned()
    } else {
        format!("{name}-{version}")
    }
}

/// Union of the current finalizers and `extra`, preserving order
pub(crate) fn merge_finalizers(current: Option<&Vec<String>>, extra: &[String]) -> Vec<String> {
    let mut merged = current.cloned().unwrap_or_default();
    for token in extra {
        if !merged.iter().any(|existing| existing == token) {
            merged.push(token.clone());
        }
    }
    merged
}

/// Current finalizers minus `dropped`
pub(crate) fn strip_finalizers(current: Option<&Vec<String>>, dropped: &[String]) -> Vec<String> {
    current
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|token| !dropped.iter().any(|gone| gone == token))
        .collect()
}

#[cfg(test)]
mod test {
    use super::{merge_finalizers, named_version, strip_finalizers};

    #[test]
    fn test_named_version() {
        assert_eq!(named_version("titanic-rfc", ""), "titanic-rfc");
        assert_eq!(named_version("titanic-rfc", "0abc-0z"), "titanic-rfc-0abc-0z");
    }

    #[test]
    fn test_merge_finalizers() {
        let current = vec!["a".to_owned(), "b".to_owned()];
        let merged = merge_finalizers(Some(&current), &["b".to_owned(), "c".to_owned()]);
        assert_eq!(merged, ["a", "b", "c"]);
        assert_eq!(merge_finalizers(None, &["a".to_owned()]), ["a"]);
    }

    #[test]
    fn test_strip_finalizers() {
        let current = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let stripped = strip_finalizers(Some(&current), &["b".to_owned(), "x".to_owned()]);
        assert_eq!(stripped, ["a", "c"]);
        assert!(strip_finalizers(None, &["a".to_owned()]).is_empty());
    }
}
