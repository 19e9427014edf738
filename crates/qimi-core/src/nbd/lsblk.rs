//! Parsing of `lsblk -b -P -o NAME,FSTYPE,SIZE` output.
//!
//! The pairs format (`NAME="nbd0p1" FSTYPE="ext4" SIZE="1073741824"`)
//! keeps empty columns addressable, which the whitespace-separated raw
//! format does not.

/// One row of lsblk output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// Kernel device name (`nbd0p1`).
    pub name: String,
    /// Filesystem type, `None` when blank.
    pub fstype: Option<String>,
    /// Size in bytes, `None` when blank or unparsable.
    pub size_bytes: Option<u64>,
}

/// Parses every row that carries a `NAME` key.
#[must_use]
pub fn parse_pairs(output: &str) -> Vec<BlockEntry> {
    output
        .lines()
        .filter_map(|line| {
            let pairs = split_pairs(line);
            let name = lookup(&pairs, "NAME").filter(|n| !n.is_empty())?;
            Some(BlockEntry {
                name: name.to_string(),
                fstype: lookup(&pairs, "FSTYPE")
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
                size_bytes: lookup(&pairs, "SIZE").and_then(|s| s.parse().ok()),
            })
        })
        .collect()
}

fn lookup<'a>(pairs: &'a [(&'a str, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
}

/// Splits `KEY="value" KEY2="value 2"` into pairs, honoring lsblk's
/// `\xNN` escapes inside values.
fn split_pairs(line: &str) -> Vec<(&str, String)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim_start();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim();
        let body = &rest[eq + 2..];
        let Some(close) = body.find('"') else {
            break;
        };
        pairs.push((key, unescape_hex(&body[..close])));
        rest = body[close + 1..].trim_start();
    }
    pairs
}

fn unescape_hex(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && i + 4 <= bytes.len()
            && bytes[i + 2..i + 4].iter().all(u8::is_ascii_hexdigit)
        {
            if let Ok(b) = u8::from_str_radix(&value[i + 2..i + 4], 16) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
