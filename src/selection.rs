//! Cache identity for generated content.
//!
//! A [`GenerationKey`] names "what must be generated" without touching the
//! document bytes: the content hash, the unit (page), the prompt version,
//! the locale, the mode, and, for user-directed selections, a digest of the
//! selected regions. Selection digests are geometric, not pixel-based: the
//! same logical regions hash identically regardless of which client
//! rendered them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Coordinates are normalized to [0, 1] page space and rounded to two
/// decimal places before hashing, so floating-point jitter between rendering
/// pipelines cannot split the cache.
const COORD_SCALE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub unit: i32,
    pub rect: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Explain,
    Summary,
    Outline,
    Selection,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Explain => "explain",
            GenerationMode::Summary => "summary",
            GenerationMode::Outline => "outline",
            GenerationMode::Selection => "selection",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "explain" => Some(GenerationMode::Explain),
            "summary" => Some(GenerationMode::Summary),
            "outline" => Some(GenerationMode::Outline),
            "selection" => Some(GenerationMode::Selection),
            _ => None,
        }
    }

    /// Selection mode is the only mode carrying a region digest.
    pub fn requires_selection(&self) -> bool {
        matches!(self, GenerationMode::Selection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationKey {
    pub content_hash: String,
    pub unit_index: i32,
    pub prompt_version: String,
    pub locale: String,
    pub mode: GenerationMode,
    pub selection_digest: Option<String>,
}

impl GenerationKey {
    pub fn page(
        content_hash: impl Into<String>,
        unit_index: i32,
        prompt_version: impl Into<String>,
        locale: impl Into<String>,
        mode: GenerationMode,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            unit_index,
            prompt_version: prompt_version.into(),
            locale: locale.into(),
            mode,
            selection_digest: None,
        }
    }

    /// The digest value stored in the unique index column; absent digests
    /// map to the empty string so the index covers every row.
    pub fn digest_column(&self) -> &str {
        self.selection_digest.as_deref().unwrap_or("")
    }
}

fn scale_coord(value: f64) -> i64 {
    (value * COORD_SCALE).round() as i64
}

fn scaled_rect(rect: &Rect) -> (i64, i64, i64, i64) {
    (
        scale_coord(rect.x),
        scale_coord(rect.y),
        scale_coord(rect.width),
        scale_coord(rect.height),
    )
}

#[derive(Serialize)]
struct CanonicalRegion {
    unit: i32,
    x: i64,
    y: i64,
    w: i64,
    h: i64,
}

#[derive(Serialize)]
struct CanonicalSelection<'a> {
    prompt_version: &'a str,
    locale: &'a str,
    mode: &'a str,
    regions: Vec<CanonicalRegion>,
}

/// Digest of a canonicalized region selection. Rounds every coordinate,
/// sorts regions lexicographically by
/// `(unit, x, y, width, height)` and hashes the fixed-field-order
/// serialization together with the prompt version, locale and mode.
pub fn compute_selection_digest(
    regions: &[Region],
    prompt_version: &str,
    locale: &str,
    mode: GenerationMode,
) -> String {
    let mut canonical: Vec<CanonicalRegion> = regions
        .iter()
        .map(|region| {
            let (x, y, w, h) = scaled_rect(&region.rect);
            CanonicalRegion {
                unit: region.unit,
                x,
                y,
                w,
                h,
            }
        })
        .collect();
    canonical.sort_by_key(|r| (r.unit, r.x, r.y, r.w, r.h));

    let selection = CanonicalSelection {
        prompt_version,
        locale,
        mode: mode.as_str(),
        regions: canonical,
    };
    let bytes = serde_json::to_vec(&selection).expect("canonical selection serializes");

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic region identifier for UI-side matching; same rounding as
/// the digest, and invertible via [`parse_region_id`]. Coordinates are
/// encoded as integer hundredths.
pub fn region_id(unit: i32, rect: &Rect) -> String {
    let (x, y, w, h) = scaled_rect(rect);
    format!("r{unit}:{x}:{y}:{w}:{h}")
}

pub fn parse_region_id(id: &str) -> Option<Region> {
    let rest = id.strip_prefix('r')?;
    let mut parts = rest.split(':');
    let unit = parts.next()?.parse::<i32>().ok()?;
    let x = parts.next()?.parse::<i64>().ok()?;
    let y = parts.next()?.parse::<i64>().ok()?;
    let w = parts.next()?.parse::<i64>().ok()?;
    let h = parts.next()?.parse::<i64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Region {
        unit,
        rect: Rect {
            x: x as f64 / COORD_SCALE,
            y: y as f64 / COORD_SCALE,
            width: w as f64 / COORD_SCALE,
            height: h as f64 / COORD_SCALE,
        },
    })
}

/// Content identity for uploaded bytes; everything downstream keys off this
/// hex digest instead of rehashing per request.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}
