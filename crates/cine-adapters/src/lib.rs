//! Raw catalog API payloads -> normalized rows.
//!
//! The source API names the same attribute differently across endpoints and
//! versions, so every attribute is looked up through an ordered list of
//! candidate field names. The first candidate holding a *truthy* value wins:
//! `null`, `false`, `0`, `""`, `[]` and `{}` fall through to the next name.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cine_core::{canonical_json, derive_id, FilmRow, GenreRow, ReviewRow};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "cine-adapters";

pub const GENRE_ID_FIELDS: &[&str] = &["idGenero", "id", "generoId"];
pub const GENRE_NAME_FIELDS: &[&str] = &["nome", "name"];
pub const UNKNOWN_GENRE_NAME: &str = "unknown";

/// Film references inside a genre's film list.
pub const FILM_REF_ID_FIELDS: &[&str] = &["idFilme", "id", "filmeId"];

pub const FILM_TITLE_FIELDS: &[&str] = &["titulo", "title"];
pub const FILM_ORIGINAL_TITLE_FIELDS: &[&str] = &["tituloOriginal", "originalTitle"];
pub const FILM_YEAR_FIELDS: &[&str] = &["ano", "year"];
pub const FILM_RELEASE_DATE_FIELDS: &[&str] = &["dataLancamento", "releaseDate"];
pub const FILM_RUNTIME_FIELDS: &[&str] = &["duracao", "runtime"];
pub const FILM_LANGUAGE_FIELDS: &[&str] = &["idioma", "language"];
pub const FILM_SYNOPSIS_FIELDS: &[&str] = &["sinopse", "overview"];

pub const REVIEW_ID_FIELDS: &[&str] = &["idAvaliacao", "id"];
pub const REVIEW_RATING_FIELDS: &[&str] = &["nota", "rating"];
pub const REVIEW_AUTHOR_FIELDS: &[&str] = &["autor", "user"];
pub const REVIEW_COMMENT_FIELDS: &[&str] = &["comentario", "comment"];
pub const REVIEW_DATE_FIELDS: &[&str] = &["data", "createdAt"];

pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

pub fn first_truthy<'a>(doc: &'a JsonValue, candidates: &[&str]) -> Option<&'a JsonValue> {
    candidates
        .iter()
        .filter_map(|name| doc.get(*name))
        .find(|value| is_truthy(value))
}

/// The elements of a list payload, or `None` when the payload is not an array.
pub fn as_documents(payload: &JsonValue) -> Option<&[JsonValue]> {
    payload.as_array().map(Vec::as_slice)
}

/// Integer identifiers arrive as numbers or numeric strings.
pub fn coerce_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn coerce_float(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn coerce_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn coerce_date(value: &JsonValue) -> Option<NaiveDate> {
    let s = value.as_str()?.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    s.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Timestamps without an offset are taken as UTC; bare dates become midnight.
pub fn coerce_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn resolve<T>(doc: &JsonValue, candidates: &[&str], coerce: fn(&JsonValue) -> Option<T>) -> Option<T> {
    first_truthy(doc, candidates).and_then(coerce)
}

/// Id of a film reference in a genre's film list.
pub fn resolve_film_ref(doc: &JsonValue) -> Option<i64> {
    resolve(doc, FILM_REF_ID_FIELDS, coerce_int)
}

pub fn transform_genres(payload: &[JsonValue]) -> Vec<GenreRow> {
    transform_genres_at(payload, Utc::now())
}

pub fn transform_genres_at(payload: &[JsonValue], updated_at: DateTime<Utc>) -> Vec<GenreRow> {
    payload
        .iter()
        .filter_map(|doc| {
            let genre_id = resolve(doc, GENRE_ID_FIELDS, coerce_int)?;
            let name = resolve(doc, GENRE_NAME_FIELDS, coerce_text)
                .unwrap_or_else(|| UNKNOWN_GENRE_NAME.to_string());
            Some(GenreRow {
                genre_id,
                name,
                raw_payload: doc.clone(),
                updated_at,
            })
        })
        .collect()
}

pub fn transform_film_detail(film_id: i64, detail: &JsonValue) -> FilmRow {
    transform_film_detail_at(film_id, detail, Utc::now())
}

pub fn transform_film_detail_at(
    film_id: i64,
    detail: &JsonValue,
    updated_at: DateTime<Utc>,
) -> FilmRow {
    FilmRow {
        film_id,
        title: resolve(detail, FILM_TITLE_FIELDS, coerce_text),
        original_title: resolve(detail, FILM_ORIGINAL_TITLE_FIELDS, coerce_text),
        year: resolve(detail, FILM_YEAR_FIELDS, coerce_int),
        release_date: resolve(detail, FILM_RELEASE_DATE_FIELDS, coerce_date),
        runtime_minutes: resolve(detail, FILM_RUNTIME_FIELDS, coerce_int),
        language: resolve(detail, FILM_LANGUAGE_FIELDS, coerce_text),
        synopsis: resolve(detail, FILM_SYNOPSIS_FIELDS, coerce_text),
        raw_payload: detail.clone(),
        updated_at,
    }
}

/// Id the review would get when the source omits one: the fingerprint of the
/// review's own fields plus `film_id` (a review field of that name wins).
pub fn fallback_review_id(film_id: i64, review: &Map<String, JsonValue>) -> String {
    let mut keyed = Map::new();
    keyed.insert("film_id".to_string(), JsonValue::from(film_id));
    keyed.extend(review.iter().map(|(k, v)| (k.clone(), v.clone())));
    derive_id(&JsonValue::Object(keyed))
}

pub fn transform_reviews(film_id: i64, payload: &[JsonValue]) -> Vec<ReviewRow> {
    payload
        .iter()
        .filter_map(|doc| {
            let fields = doc.as_object()?;
            let review_id = match first_truthy(doc, REVIEW_ID_FIELDS) {
                Some(JsonValue::String(s)) => s.clone(),
                Some(other) => canonical_json(other),
                None => fallback_review_id(film_id, fields),
            };
            Some(ReviewRow {
                review_id,
                film_id,
                rating: resolve(doc, REVIEW_RATING_FIELDS, coerce_float),
                author: resolve(doc, REVIEW_AUTHOR_FIELDS, coerce_text),
                comment: resolve(doc, REVIEW_COMMENT_FIELDS, coerce_text),
                review_date: resolve(doc, REVIEW_DATE_FIELDS, coerce_timestamp),
                raw_payload: doc.clone(),
            })
        })
        .collect()
}
