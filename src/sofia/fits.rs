use std::collections::HashMap;
use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::error::TaskError;
use crate::model::Boundary;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
// A primary header larger than this is not a cube we can make sense of.
const MAX_HEADER_BLOCKS: usize = 1024;

/// Read the primary header of a FITS file as raw keyword/value strings.
///
/// Only the header blocks are read; the data payload is never touched.
pub async fn primary_header(path: &Path) -> Result<HashMap<String, String>, TaskError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut cards = HashMap::new();
    let mut block = [0u8; BLOCK_SIZE];

    for _ in 0..MAX_HEADER_BLOCKS {
        file.read_exact(&mut block)
            .await
            .map_err(|_| TaskError::fits(path, "truncated primary header"))?;

        for card in block.chunks(CARD_SIZE) {
            let keyword = String::from_utf8_lossy(&card[..8]).trim_end().to_string();
            if keyword == "END" {
                return Ok(cards);
            }
            if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
                continue;
            }
            if &card[8..10] == b"= " {
                cards.insert(keyword, card_value(&card[10..]));
            }
        }
    }

    Err(TaskError::fits(path, "END card not found"))
}

/// Extract the value portion of an 80-byte card: quoted strings keep their
/// content, everything else is cut at the inline comment and trimmed.
fn card_value(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('\'') {
        match rest.find('\'') {
            Some(end) => rest[..end].trim_end().to_string(),
            None => rest.trim_end().to_string(),
        }
    } else {
        text.split('/').next().unwrap_or("").trim().to_string()
    }
}

/// Derive the full-cube boundary from a header when no explicit region was
/// configured: `[0, NAXIS1-1, 0, NAXIS2-1, 0, NAXISn-1]` with `n` the axis
/// whose CTYPE is FREQ.
pub fn cube_boundary(path: &Path, header: &HashMap<String, String>) -> Result<Boundary, TaskError> {
    let x_max = axis_len(path, header, "NAXIS1")?;
    let y_max = axis_len(path, header, "NAXIS2")?;

    let freq_axis = if header.get("CTYPE3").map(|v| v.trim()) == Some("FREQ") {
        "NAXIS3"
    } else if header.get("CTYPE4").map(|v| v.trim()) == Some("FREQ") {
        "NAXIS4"
    } else {
        return Err(TaskError::fits(path, "no FREQ axis in CTYPE3/CTYPE4"));
    };
    let z_max = axis_len(path, header, freq_axis)?;

    Ok(Boundary([0, x_max - 1, 0, y_max - 1, 0, z_max - 1]))
}

fn axis_len(
    path: &Path,
    header: &HashMap<String, String>,
    keyword: &str,
) -> Result<i64, TaskError> {
    header
        .get(keyword)
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| TaskError::fits(path, format!("{keyword} is missing or not an integer")))
}
