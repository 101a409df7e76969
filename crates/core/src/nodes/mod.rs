#![forbid(unsafe_code)]

//! Scheduler node-range notation (`nid00[040,392-394]`) and canonical node names.
//!
//! A canonical name is the alphabetic stem of a host name followed by its numeric
//! index zero-padded to the configured width (`nid` + `00040`). Indices wider than
//! the padding are kept as they are.


pub const DEFAULT_INDEX_WIDTH: usize = 5;
const MAX_EXPANDED_NODES: usize = 65_536;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NodeRangeError {
    #[error("node range is empty")]
    Empty,
    #[error("unbalanced or nested brackets in {token:?}")]
    UnbalancedBrackets { token: String },
    #[error("empty element in {token:?}")]
    EmptyElement { token: String },
    #[error("{value:?} is not numeric in {token:?}")]
    NotNumeric { token: String, value: String },
    #[error("descending range {start}-{end} in {token:?}")]
    DescendingRange { token: String, start: u64, end: u64 },
    #[error("{token:?} expands to too many nodes")]
    TooManyNodes { token: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRangeExpander {
    index_width: usize,
}

impl Default for NodeRangeExpander {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_WIDTH)
    }
}

impl NodeRangeExpander {
    pub fn new(index_width: usize) -> Self {
        Self { index_width }
    }

    pub fn index_width(&self) -> usize {
        self.index_width
    }

    /// Expands one scheduler node-range token into canonical node names, in
    /// the order the token lists them.
    ///
    /// Accepts a bare host (`nid99`), a bracketed list (`nid00[040,392-394]`)
    /// and a top-level comma list of either (`nid00[010-011],nid00020`).
    pub fn expand(&self, token: &str) -> Result<Vec<String>, NodeRangeError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(NodeRangeError::Empty);
        }

        let mut out = Vec::new();
        for part in split_top_level(token)? {
            if part.is_empty() {
                return Err(NodeRangeError::EmptyElement {
                    token: token.to_string(),
                });
            }
            for raw in expand_part(token, part)? {
                if out.len() >= MAX_EXPANDED_NODES {
                    return Err(NodeRangeError::TooManyNodes {
                        token: token.to_string(),
                    });
                }
                out.push(self.canonicalize(&raw));
            }
        }
        Ok(out)
    }

    /// Re-pads the trailing numeric index of a host name. Names without a
    /// trailing index are returned unchanged.
    pub fn canonicalize(&self, name: &str) -> String {
        let digits = name.bytes().rev().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return name.to_string();
        }
        let (stem, index) = name.split_at(name.len() - digits);
        match index.parse::<u64>() {
            Ok(index) => format!("{stem}{index:0width$}", width = self.index_width),
            Err(_) => name.to_string(),
        }
    }
}

pub fn expand(token: &str) -> Result<Vec<String>, NodeRangeError> {
    NodeRangeExpander::default().expand(token)
}

fn split_top_level(token: &str) -> Result<Vec<&str>, NodeRangeError> {
    let unbalanced = || NodeRangeError::UnbalancedBrackets {
        token: token.to_string(),
    };

    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in token.char_indices() {
        match ch {
            '[' => {
                if depth > 0 {
                    return Err(unbalanced());
                }
                depth += 1;
            }
            ']' => {
                if depth == 0 {
                    return Err(unbalanced());
                }
                depth -= 1;
            }
            ',' if depth == 0 => {
                parts.push(token[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(unbalanced());
    }
    parts.push(token[start..].trim());
    Ok(parts)
}

fn expand_part(token: &str, part: &str) -> Result<Vec<String>, NodeRangeError> {
    let Some(open) = part.find('[') else {
        return Ok(vec![part.to_string()]);
    };
    let Some(close) = part.find(']') else {
        return Err(NodeRangeError::UnbalancedBrackets {
            token: token.to_string(),
        });
    };
    // Anything after the closing bracket is not part of the range.
    let prefix = &part[..open];
    let body = &part[open + 1..close];
    let mut out = Vec::new();
    for element in body.split(',') {
        let element = element.trim();
        if element.is_empty() {
            return Err(NodeRangeError::EmptyElement {
                token: token.to_string(),
            });
        }
        match element.split_once('-') {
            Some((lo, hi)) => {
                let start = parse_index(token, lo)?;
                let end = parse_index(token, hi)?;
                if start > end {
                    return Err(NodeRangeError::DescendingRange {
                        token: token.to_string(),
                        start,
                        end,
                    });
                }
                if end - start >= MAX_EXPANDED_NODES as u64 {
                    return Err(NodeRangeError::TooManyNodes {
                        token: token.to_string(),
                    });
                }
                // The scheduler pads a range to the width of its first endpoint.
                let width = lo.len();
                for index in start..=end {
                    out.push(format!("{prefix}{index:0width$}"));
                }
            }
            None => {
                parse_index(token, element)?;
                out.push(format!("{prefix}{element}"));
            }
        }
    }
    Ok(out)
}

fn parse_index(token: &str, raw: &str) -> Result<u64, NodeRangeError> {
    let not_numeric = || NodeRangeError::NotNumeric {
        token: token.to_string(),
        value: raw.to_string(),
    };
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(not_numeric());
    }
    raw.parse::<u64>().map_err(|_| not_numeric())
}
