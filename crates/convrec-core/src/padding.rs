//! Truncation and padding primitives.
//!
//! Two conventions matter and must not be mixed up:
//!
//! - `truncate_tail = false` discards the *earliest* elements, keeping the
//!   most recent context.
//! - `pad_tail = false` pads on the left so content is flush right. Context
//!   fields use this; response fields pad on the right so that position `i`
//!   of the decoder output lines up with token `i` of the response.

/// Row-major matrix of ids with a fixed row width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMatrix {
    rows: usize,
    cols: usize,
    data: Vec<u32>,
}

impl IdMatrix {
    /// Create from a flat buffer. `data.len()` must equal `rows * cols`.
    pub fn from_flat(rows: usize, cols: usize, data: Vec<u32>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn row(&self, i: usize) -> &[u32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u32> {
        self.data
    }

    /// 1 where the id differs from `pad`, else 0.
    pub fn mask(&self, pad: u32) -> IdMatrix {
        IdMatrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&x| u32::from(x != pad)).collect(),
        }
    }

    /// Concatenate two matrices with equal row counts along columns.
    pub fn hcat(&self, other: &IdMatrix) -> Option<IdMatrix> {
        if self.rows != other.rows {
            return None;
        }
        let cols = self.cols + other.cols;
        let mut data = Vec::with_capacity(self.rows * cols);
        for i in 0..self.rows {
            data.extend_from_slice(self.row(i));
            data.extend_from_slice(other.row(i));
        }
        Some(IdMatrix {
            rows: self.rows,
            cols,
            data,
        })
    }
}

/// Row-major dense `f32` matrix (multi-hot labels).
#[derive(Debug, Clone, PartialEq)]
pub struct FloatMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl FloatMatrix {
    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }
}

/// Keep at most `max_length` elements.
///
/// With `truncate_tail` the tail is cut, otherwise the head.
pub fn truncate(vec: &[u32], max_length: Option<usize>, truncate_tail: bool) -> Vec<u32> {
    match max_length {
        Some(max) if vec.len() > max => {
            if truncate_tail {
                vec[..max].to_vec()
            } else {
                vec[vec.len() - max..].to_vec()
            }
        }
        _ => vec.to_vec(),
    }
}

/// Flatten utterances, optionally separated by `split` and terminated with
/// `final_token`. The trailing separator is dropped unless
/// `keep_split_in_tail` is set.
pub fn merge_utterances(
    conversation: &[Vec<u32>],
    split: Option<u32>,
    keep_split_in_tail: bool,
    final_token: Option<u32>,
) -> Vec<u32> {
    let mut merged = Vec::new();
    for utt in conversation {
        merged.extend_from_slice(utt);
        if let Some(s) = split {
            merged.push(s);
        }
    }
    if split.is_some() && !keep_split_in_tail {
        merged.pop();
    }
    if let Some(f) = final_token {
        merged.push(f);
    }
    merged
}

/// Wrap with optional start and end markers.
pub fn add_start_end(vec: Vec<u32>, start: Option<u32>, end: Option<u32>) -> Vec<u32> {
    let mut out = Vec::with_capacity(vec.len() + 2);
    out.extend(start);
    out.extend(vec);
    out.extend(end);
    out
}

/// Pad rows to a common width.
///
/// The width is the longest row, at least 1, and at least `max_len` when
/// given. Rows are expected to have been truncated to `max_len` already.
pub fn pad_matrix(items: &[Vec<u32>], pad: u32, pad_tail: bool, max_len: Option<usize>) -> IdMatrix {
    let longest = items.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let width = max_len.map_or(longest, |m| longest.max(m));
    let mut data = vec![pad; items.len() * width];
    for (i, item) in items.iter().enumerate() {
        let row = &mut data[i * width..(i + 1) * width];
        let len = item.len().min(width);
        if pad_tail {
            row[..len].copy_from_slice(&item[..len]);
        } else {
            row[width - len..].copy_from_slice(&item[item.len() - len..]);
        }
    }
    IdMatrix {
        rows: items.len(),
        cols: width,
        data,
    }
}

/// Multi-hot rows over `n` classes. Ids `>= n` are ignored.
pub fn multi_hot(rows: &[Vec<u32>], n: usize) -> FloatMatrix {
    let mut data = vec![0f32; rows.len() * n];
    for (i, row) in rows.iter().enumerate() {
        for &id in row {
            if (id as usize) < n {
                data[i * n + id as usize] = 1.0;
            }
        }
    }
    FloatMatrix {
        rows: rows.len(),
        cols: n,
        data,
    }
}
