// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use std::path::Path;

/// Read a file and parse its content into the specified type.
///
/// Trims null and whitespace before parsing.
///
/// # Errors
/// Returns an error if reading or parsing fails.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };
    let val = val.trim_end_matches('\0');

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val.trim(), path);
        }
    }
}

/// Read a whitespace separated list of integers, e.g. cpufreq's
/// `related_cpus` or `scaling_available_frequencies`.
pub fn read_file_usize_vec(path: &Path) -> Result<Vec<usize>> {
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    let val = val.trim_end_matches('\0');

    val.split_whitespace()
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| anyhow!("Failed to parse '{}' as usize in {:?}", s, path))
        })
        .collect::<Result<Vec<usize>>>()
}

/// Read a file as a trimmed string.
pub fn read_file_string(path: &Path) -> Result<String> {
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    Ok(val.trim_end_matches('\0').trim().to_string())
}

/// Overwrite a sysfs-style attribute with `val`.
pub fn write_to_file(path: &Path, val: &str) -> Result<()> {
    std::fs::write(path, val).with_context(|| format!("Failed to write '{}' to {:?}", val, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_helpers() {
        let tmp = TempDir::new().unwrap();
        let num = tmp.path().join("num");
        let list = tmp.path().join("list");
        std::fs::write(&num, "1800000\n").unwrap();
        std::fs::write(&list, "300000 600000 1200000 \n").unwrap();

        assert_eq!(read_from_file::<u32>(&num).unwrap(), 1800000);
        assert_eq!(
            read_file_usize_vec(&list).unwrap(),
            vec![300000, 600000, 1200000]
        );
        assert!(read_from_file::<u32>(&tmp.path().join("missing")).is_err());

        write_to_file(&num, "42").unwrap();
        assert_eq!(read_file_string(&num).unwrap(), "42");
    }
}
