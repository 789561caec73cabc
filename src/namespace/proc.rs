use std::path::Path;

use crate::error::{Error, IoResultExt, Result};
use crate::namespace::IdMapping;

/// parse /proc/self/uid_map or gid_map format
/// format: "inside_start outside_start count" per line, whitespace separated
pub fn parse_id_map(content: &str) -> Result<Vec<IdMapping>> {
    let mut entries = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            continue; // blank or malformed
        }

        let field = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| Error::MappingParse(format!("bad id map line {line:?}")))
        };
        entries.push(IdMapping::new(
            field(parts[0])?,
            field(parts[1])?,
            field(parts[2])?,
        ));
    }

    Ok(entries)
}

/// read current process uid map from /proc/self/uid_map
pub fn current_uid_map() -> Result<Vec<IdMapping>> {
    let path = Path::new("/proc/self/uid_map");
    let content = std::fs::read_to_string(path).with_path(path)?;
    parse_id_map(&content)
}

/// whether the process lives in a user namespace other than the initial one
///
/// the initial namespace reports the full identity range. anything else means
/// "root" here may still be unable to create device nodes.
pub fn running_in_user_namespace() -> bool {
    match current_uid_map() {
        Ok(map) => !is_initial_namespace(&map),
        Err(_) => false,
    }
}

fn is_initial_namespace(map: &[IdMapping]) -> bool {
    map.len() == 1 && map[0] == IdMapping::new(0, 0, u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_mapping() {
        // real root outside any namespace
        let content = "         0          0 4294967295\n";
        let entries = parse_id_map(content).unwrap();
        assert_eq!(entries, vec![IdMapping::new(0, 0, 4294967295)]);
        assert!(is_initial_namespace(&entries));
    }

    #[test]
    fn test_parse_podman_mapping() {
        // typical podman unshare mapping
        let content = "         0       1000          1\n         1     100000      65536\n";
        let entries = parse_id_map(content).unwrap();
        assert_eq!(
            entries,
            vec![IdMapping::new(0, 1000, 1), IdMapping::new(1, 100000, 65536)]
        );
        assert!(!is_initial_namespace(&entries));
    }

    #[test]
    fn test_parse_whitespace_only() {
        assert!(parse_id_map("").unwrap().is_empty());
        assert!(parse_id_map("   \n\n  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_bad_number() {
        assert!(parse_id_map("0 x 1\n").is_err());
    }

    #[test]
    fn test_current_map_readable() {
        // every linux process has one
        assert!(!current_uid_map().unwrap().is_empty());
    }
}
