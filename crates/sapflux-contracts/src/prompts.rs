use std::path::Path;

use anyhow::{bail, Context};

/// One prompt per line. Lines are trimmed and blank lines dropped; a file
/// with no prompts left is an error.
pub fn read_prompts_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading prompts file {}", path.display()))?;
    let prompts = parse_prompt_lines(&raw);
    if prompts.is_empty() {
        bail!("prompts file {} contains no prompts", path.display());
    }
    Ok(prompts)
}

pub fn parse_prompt_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_prompt_lines, read_prompts_file};

    #[test]
    fn blank_lines_are_skipped_and_order_kept() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("prompts.txt");
        std::fs::write(&path, "  A dragon blowing water  \n\n\t\nShrek is blue\r\n")?;
        assert_eq!(
            read_prompts_file(&path)?,
            vec!["A dragon blowing water", "Shrek is blue"]
        );
        Ok(())
    }

    #[test]
    fn empty_or_missing_file_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("prompts.txt");
        assert!(read_prompts_file(&path).is_err());
        std::fs::write(&path, "\n   \n")?;
        let err = read_prompts_file(&path).err().map(|err| err.to_string());
        assert!(err.unwrap_or_default().contains("no prompts"));
        assert!(parse_prompt_lines("").is_empty());
        Ok(())
    }
}
