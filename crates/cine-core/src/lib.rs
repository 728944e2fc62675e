//! Catalog row model, declared collection schemas and deterministic identity derivation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "cine-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    BigInt,
    Double,
    Text,
    Date,
    Timestamp,
    Json,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::BigInt => "BIGINT",
            ColumnKind::Double => "DOUBLE PRECISION",
            ColumnKind::Text => "TEXT",
            ColumnKind::Date => "DATE",
            ColumnKind::Timestamp => "TIMESTAMPTZ",
            ColumnKind::Json => "JSONB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

/// Declared shape of a target table. Rows are checked against this, never
/// against whatever the live database happens to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub key: &'static [&'static str],
}

impl Collection {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

pub const GENRES: Collection = Collection {
    name: "genres",
    columns: &[
        col("genre_id", ColumnKind::BigInt),
        col("name", ColumnKind::Text),
        col("raw_payload", ColumnKind::Json),
        col("updated_at", ColumnKind::Timestamp),
    ],
    key: &["genre_id"],
};

pub const FILMS: Collection = Collection {
    name: "films",
    columns: &[
        col("film_id", ColumnKind::BigInt),
        col("title", ColumnKind::Text),
        col("original_title", ColumnKind::Text),
        col("year", ColumnKind::BigInt),
        col("release_date", ColumnKind::Date),
        col("runtime_minutes", ColumnKind::BigInt),
        col("language", ColumnKind::Text),
        col("synopsis", ColumnKind::Text),
        col("raw_payload", ColumnKind::Json),
        col("updated_at", ColumnKind::Timestamp),
    ],
    key: &["film_id"],
};

pub const FILM_GENRES: Collection = Collection {
    name: "film_genres",
    columns: &[
        col("film_id", ColumnKind::BigInt),
        col("genre_id", ColumnKind::BigInt),
    ],
    key: &["film_id", "genre_id"],
};

pub const REVIEWS: Collection = Collection {
    name: "reviews",
    columns: &[
        col("review_id", ColumnKind::Text),
        col("film_id", ColumnKind::BigInt),
        col("rating", ColumnKind::Double),
        col("author", ColumnKind::Text),
        col("comment", ColumnKind::Text),
        col("review_date", ColumnKind::Timestamp),
        col("raw_payload", ColumnKind::Json),
    ],
    key: &["review_id"],
};

pub const ALL_COLLECTIONS: [&Collection; 4] = [&GENRES, &FILMS, &FILM_GENRES, &REVIEWS];

/// A single typed column value ready to be bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    BigInt(Option<i64>),
    Double(Option<f64>),
    Text(Option<String>),
    Date(Option<NaiveDate>),
    Timestamp(Option<DateTime<Utc>>),
    Json(JsonValue),
}

impl Cell {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Cell::BigInt(_) => ColumnKind::BigInt,
            Cell::Double(_) => ColumnKind::Double,
            Cell::Text(_) => ColumnKind::Text,
            Cell::Date(_) => ColumnKind::Date,
            Cell::Timestamp(_) => ColumnKind::Timestamp,
            Cell::Json(_) => ColumnKind::Json,
        }
    }

    /// Stable text form used to compare key values across rows.
    pub fn key_repr(&self) -> String {
        format!("{self:?}")
    }
}

/// Row types that know which collection they belong to and how to flatten
/// themselves into cells, in declared column order.
pub trait Record {
    const COLLECTION: &'static Collection;

    fn cells(&self) -> Vec<Cell>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreRow {
    pub genre_id: i64,
    pub name: String,
    pub raw_payload: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl Record for GenreRow {
    const COLLECTION: &'static Collection = &GENRES;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::BigInt(Some(self.genre_id)),
            Cell::Text(Some(self.name.clone())),
            Cell::Json(self.raw_payload.clone()),
            Cell::Timestamp(Some(self.updated_at)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmRow {
    pub film_id: i64,
    pub title: Option<String>,
    pub original_title: Option<String>,
    pub year: Option<i64>,
    pub release_date: Option<NaiveDate>,
    pub runtime_minutes: Option<i64>,
    pub language: Option<String>,
    pub synopsis: Option<String>,
    pub raw_payload: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl Record for FilmRow {
    const COLLECTION: &'static Collection = &FILMS;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::BigInt(Some(self.film_id)),
            Cell::Text(self.title.clone()),
            Cell::Text(self.original_title.clone()),
            Cell::BigInt(self.year),
            Cell::Date(self.release_date),
            Cell::BigInt(self.runtime_minutes),
            Cell::Text(self.language.clone()),
            Cell::Text(self.synopsis.clone()),
            Cell::Json(self.raw_payload.clone()),
            Cell::Timestamp(Some(self.updated_at)),
        ]
    }
}

/// Many-to-many association between a film and a genre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilmGenreLink {
    pub film_id: i64,
    pub genre_id: i64,
}

impl Record for FilmGenreLink {
    const COLLECTION: &'static Collection = &FILM_GENRES;

    fn cells(&self) -> Vec<Cell> {
        vec![Cell::BigInt(Some(self.film_id)), Cell::BigInt(Some(self.genre_id))]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRow {
    pub review_id: String,
    pub film_id: i64,
    pub rating: Option<f64>,
    pub author: Option<String>,
    pub comment: Option<String>,
    pub review_date: Option<DateTime<Utc>>,
    pub raw_payload: JsonValue,
}

impl Record for ReviewRow {
    const COLLECTION: &'static Collection = &REVIEWS;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Text(Some(self.review_id.clone())),
            Cell::BigInt(Some(self.film_id)),
            Cell::Double(self.rating),
            Cell::Text(self.author.clone()),
            Cell::Text(self.comment.clone()),
            Cell::Timestamp(self.review_date),
            Cell::Json(self.raw_payload.clone()),
        ]
    }
}

/// Canonical JSON: object keys sorted by code point, compact separators,
/// non-ASCII characters written as-is.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Deterministic fingerprint for records that arrive without a native id:
/// lowercase hex SHA-256 of the canonical JSON encoding.
pub fn derive_id(record: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(record).as_bytes());
    hex::encode(hasher.finalize())
}
