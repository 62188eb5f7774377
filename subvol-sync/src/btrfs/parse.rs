//! Parsers for the text output of `btrfs` and `df`.

use super::{DiskUsage, ListedSubvolume, ShownSubvolume};
use crate::utils::InventoryError;
use uuid::Uuid;

/// btrfs prints `-` for an absent uuid
pub fn parse_optional_uuid(value: &str) -> Result<Option<Uuid>, String> {
    match value.trim() {
        "" | "-" => Ok(None),
        other => Uuid::parse_str(other)
            .map(Some)
            .map_err(|e| format!("invalid uuid {:?}: {}", other, e)),
    }
}

/// Parse one line of `btrfs subvolume list -qRu`
///
/// ```text
/// ID 257 gen 10 top level 5 parent_uuid - received_uuid - uuid 2d5e... path client1/100
/// ```
pub fn parse_list_line(line: &str) -> Result<ListedSubvolume, InventoryError> {
    let err = |reason: &str| InventoryError::Parse {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    // The path is free text and may contain spaces, so split it off first
    let (head, path) = line.split_once(" path ").ok_or_else(|| err("missing path"))?;
    let path = path.strip_prefix("<FS_TREE>/").unwrap_or(path);
    if path.is_empty() {
        return Err(err("empty path"));
    }

    let tokens: Vec<&str> = head.split_whitespace().collect();
    let value_of = |key: &str| -> Option<&str> {
        tokens
            .iter()
            .position(|t| *t == key)
            .and_then(|idx| tokens.get(idx + 1).copied())
    };

    let id = value_of("ID")
        .ok_or_else(|| err("missing ID"))?
        .parse::<u64>()
        .map_err(|_| err("ID is not a number"))?;
    let uuid = parse_optional_uuid(value_of("uuid").ok_or_else(|| err("missing uuid"))?)
        .map_err(|e| err(&e))?
        .ok_or_else(|| err("subvolume without uuid"))?;
    let parent_uuid = parse_optional_uuid(value_of("parent_uuid").unwrap_or("-")).map_err(|e| err(&e))?;
    let received_uuid = parse_optional_uuid(value_of("received_uuid").unwrap_or("-")).map_err(|e| err(&e))?;

    Ok(ListedSubvolume {
        id,
        path: path.to_string(),
        uuid,
        parent_uuid,
        received_uuid,
    })
}

/// Parse the whole listing, skipping blank lines
pub fn parse_list(output: &str) -> Result<Vec<ListedSubvolume>, InventoryError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_list_line)
        .collect()
}

/// Parse `btrfs subvolume show <path>`
pub fn parse_show(output: &str) -> Result<ShownSubvolume, String> {
    let mut uuid = None;
    let mut parent_uuid = None;
    let mut received_uuid = None;
    let mut read_only = false;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "UUID" => uuid = parse_optional_uuid(value)?,
            "Parent UUID" => parent_uuid = parse_optional_uuid(value)?,
            "Received UUID" => received_uuid = parse_optional_uuid(value)?,
            "Flags" => read_only = value.split_whitespace().any(|f| f == "readonly"),
            _ => {}
        }
    }

    Ok(ShownSubvolume {
        uuid: uuid.ok_or_else(|| "no UUID line".to_string())?,
        parent_uuid,
        received_uuid,
        read_only,
    })
}

/// Extract the filesystem uuid from `btrfs filesystem show <path>`
pub fn parse_filesystem_uuid(output: &str) -> Option<Uuid> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "uuid:" {
            return tokens.next().and_then(|v| Uuid::parse_str(v).ok());
        }
    }
    None
}

/// Parse `df -P -B1 <path>`
pub fn parse_df(output: &str) -> Result<DiskUsage, String> {
    let lines: Vec<&str> = output.trim().lines().collect();
    if lines.len() < 2 {
        return Err("unexpected df output".to_string());
    }
    let parts: Vec<&str> = lines[1].split_whitespace().collect();
    let field = |idx: usize| -> Result<u64, String> {
        parts
            .get(idx)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| format!("missing df column {}", idx))
    };
    let total = field(1)?;
    let used = field(2)?;
    let available = field(3)?;
    let used_percent = if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    Ok(DiskUsage {
        total,
        used,
        available,
        used_percent,
    })
}
