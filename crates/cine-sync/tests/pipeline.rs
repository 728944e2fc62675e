use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cine_core::{derive_id, Cell, Collection};
use cine_storage::{
    CatalogSource, GatewayError, MemoryStore, StoreError, UpsertCall, UpsertStore,
};
use cine_sync::{CatalogEtl, EtlError};
use serde_json::{json, Value as JsonValue};

/// Canned API responses keyed by path; unknown paths answer 404.
#[derive(Default)]
struct FixtureSource {
    responses: HashMap<String, JsonValue>,
    requested: Mutex<Vec<String>>,
}

impl FixtureSource {
    fn with(mut self, path: &str, body: JsonValue) -> Self {
        self.responses.insert(path.to_string(), body);
        self
    }

    fn requests_for(&self, path: &str) -> usize {
        self.requested
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }
}

#[async_trait]
impl CatalogSource for FixtureSource {
    async fn fetch_json(&self, path: &str) -> Result<JsonValue, GatewayError> {
        self.requested.lock().unwrap().push(path.to_string());
        self.responses
            .get(path)
            .cloned()
            .ok_or_else(|| GatewayError::HttpStatus {
                status: 404,
                url: path.to_string(),
            })
    }
}

/// Delegates to a [`MemoryStore`] but rejects every write to one collection.
struct RejectingStore {
    inner: MemoryStore,
    rejected: &'static str,
}

#[async_trait]
impl UpsertStore for RejectingStore {
    async fn upsert(
        &self,
        collection: &Collection,
        rows: Vec<Vec<Cell>>,
        key_fields: &[&str],
    ) -> Result<u64, StoreError> {
        if collection.name == self.rejected {
            return Err(StoreError::RowShape {
                collection: collection.name.to_string(),
                row: 0,
            });
        }
        self.inner.upsert(collection, rows, key_fields).await
    }
}

fn single_genre_catalog() -> FixtureSource {
    FixtureSource::default()
        .with("/obras/v3/generos", json!([{"id": 1, "name": "Drama"}]))
        .with("/obras/v3/generos/1/filmes", json!([{"id": 42}]))
        .with("/obras/v3/filmes/42", json!({"title": "X", "year": 2020}))
        .with("/obras/v3/filmes/42/avaliacoes", json!([{"rating": 5, "user": "a"}]))
}

fn two_genre_catalog() -> FixtureSource {
    FixtureSource::default()
        .with(
            "/obras/v3/generos",
            json!([{"idGenero": 1, "nome": "Drama"}, {"idGenero": 2, "nome": "Crime"}, {"nome": "sem id"}]),
        )
        .with("/obras/v3/generos/1/filmes", json!([{"idFilme": 42}, {"idFilme": 7}]))
        .with("/obras/v3/generos/2/filmes", json!([{"id": 42}, {"titulo": "sem id"}]))
        .with("/obras/v3/filmes/42", json!({"titulo": "Cidade de Deus", "ano": 2002}))
        .with("/obras/v3/filmes/42/avaliacoes", json!([{"idAvaliacao": "r1", "nota": 5}]))
        .with("/obras/v3/filmes/7", json!({"titulo": "Central do Brasil"}))
        .with("/obras/v3/filmes/7/avaliacoes", json!([]))
}

fn without_column(rows: Vec<Vec<Cell>>, index: usize) -> Vec<Vec<Cell>> {
    rows.into_iter()
        .map(|mut row| {
            row.remove(index);
            row
        })
        .collect()
}

#[tokio::test]
async fn single_genre_end_to_end() {
    let source = single_genre_catalog();
    let store = MemoryStore::new();

    let summary = CatalogEtl::new(&source, &store).run().await.unwrap();
    assert_eq!(summary.genres, 1);
    assert_eq!(summary.films, 1);
    assert_eq!(summary.film_genre_links, 1);
    assert_eq!(summary.reviews, 1);

    let genres = store.rows("genres").await;
    assert_eq!(genres.len(), 1);
    assert_eq!(genres[0][0], Cell::BigInt(Some(1)));
    assert_eq!(genres[0][1], Cell::Text(Some("Drama".into())));
    assert_eq!(genres[0][2], Cell::Json(json!({"id": 1, "name": "Drama"})));

    let films = store.rows("films").await;
    assert_eq!(films.len(), 1);
    assert_eq!(films[0][0], Cell::BigInt(Some(42)));
    assert_eq!(films[0][1], Cell::Text(Some("X".into())));
    assert_eq!(films[0][3], Cell::BigInt(Some(2020)));

    let links = store.rows("film_genres").await;
    assert_eq!(links, vec![vec![Cell::BigInt(Some(42)), Cell::BigInt(Some(1))]]);

    let reviews = store.rows("reviews").await;
    assert_eq!(reviews.len(), 1);
    let expected_id = derive_id(&json!({"film_id": 42, "rating": 5, "user": "a"}));
    assert_eq!(reviews[0][0], Cell::Text(Some(expected_id)));
    assert_eq!(reviews[0][1], Cell::BigInt(Some(42)));
    assert_eq!(reviews[0][2], Cell::Double(Some(5.0)));
    assert_eq!(reviews[0][3], Cell::Text(Some("a".into())));
}

#[tokio::test]
async fn film_shared_by_genres_is_fetched_and_loaded_once() {
    let source = two_genre_catalog();
    let store = MemoryStore::new();

    let summary = CatalogEtl::new(&source, &store).run().await.unwrap();
    assert_eq!(summary.genres, 2);
    assert_eq!(summary.films, 2);
    assert_eq!(summary.film_genre_links, 3);
    assert_eq!(summary.skipped_film_refs, 1);

    assert_eq!(source.requests_for("/obras/v3/filmes/42"), 1);
    assert_eq!(source.requests_for("/obras/v3/filmes/42/avaliacoes"), 1);
    assert_eq!(store.row_count("films").await, 2);

    let links = store.rows("film_genres").await;
    let pairs_for_42 = links
        .iter()
        .filter(|row| row[0] == Cell::BigInt(Some(42)))
        .map(|row| row[1].clone())
        .collect::<Vec<_>>();
    assert_eq!(
        pairs_for_42,
        vec![Cell::BigInt(Some(1)), Cell::BigInt(Some(2))]
    );
}

#[tokio::test]
async fn collections_load_in_dependency_order() {
    let source = two_genre_catalog();
    let store = MemoryStore::new();
    CatalogEtl::new(&source, &store).run().await.unwrap();

    let order = store
        .calls()
        .await
        .into_iter()
        .map(|UpsertCall { collection, .. }| collection)
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["genres", "film_genres", "films", "reviews"]);
}

#[tokio::test]
async fn rerun_with_unchanged_source_is_idempotent() {
    let source = two_genre_catalog();
    let store = MemoryStore::new();

    CatalogEtl::new(&source, &store).run().await.unwrap();
    let genres_first = without_column(store.rows("genres").await, 3);
    let films_first = without_column(store.rows("films").await, 9);
    let links_first = store.rows("film_genres").await;
    let reviews_first = store.rows("reviews").await;

    CatalogEtl::new(&source, &store).run().await.unwrap();
    assert_eq!(without_column(store.rows("genres").await, 3), genres_first);
    assert_eq!(without_column(store.rows("films").await, 9), films_first);
    assert_eq!(store.rows("film_genres").await, links_first);
    assert_eq!(store.rows("reviews").await, reviews_first);
}

#[tokio::test]
async fn genre_list_failure_aborts_before_any_load() {
    let source = FixtureSource::default();
    let store = MemoryStore::new();

    let err = CatalogEtl::new(&source, &store).run().await.unwrap_err();
    assert!(matches!(err, EtlError::Gateway(GatewayError::HttpStatus { status: 404, .. })));
    assert!(store.calls().await.is_empty());
}

#[tokio::test]
async fn film_detail_failure_keeps_links_already_loaded() {
    let source = FixtureSource::default()
        .with("/obras/v3/generos", json!([{"id": 1, "name": "Drama"}]))
        .with("/obras/v3/generos/1/filmes", json!([{"id": 42}]));
    let store = MemoryStore::new();

    let err = CatalogEtl::new(&source, &store).run().await.unwrap_err();
    assert!(matches!(err, EtlError::Gateway(_)));
    assert_eq!(store.row_count("genres").await, 1);
    assert_eq!(store.row_count("film_genres").await, 1);
    assert_eq!(store.row_count("films").await, 0);
    assert_eq!(store.row_count("reviews").await, 0);
}

#[tokio::test]
async fn store_failure_aborts_before_film_fetches() {
    let source = single_genre_catalog();
    let store = RejectingStore {
        inner: MemoryStore::new(),
        rejected: "film_genres",
    };

    let err = CatalogEtl::new(&source, &store).run().await.unwrap_err();
    assert!(matches!(err, EtlError::Store(_)), "got {err:?}");
    assert_eq!(*source.requested.lock().unwrap(), ["/obras/v3/generos", "/obras/v3/generos/1/filmes"]);
    assert_eq!(source.requests_for("/obras/v3/filmes/42"), 0);
    assert_eq!(store.inner.row_count("genres").await, 1);
    assert_eq!(store.inner.row_count("films").await, 0);
}

#[tokio::test]
async fn non_array_list_payloads_contribute_nothing() {
    let source = FixtureSource::default()
        .with("/obras/v3/generos", json!([{"id": 1, "name": "Drama"}]))
        .with("/obras/v3/generos/1/filmes", json!({"message": "no films"}));
    let store = MemoryStore::new();

    let summary = CatalogEtl::new(&source, &store).run().await.unwrap();
    assert_eq!(summary.genres, 1);
    assert_eq!(summary.films, 0);
    assert_eq!(summary.reviews, 0);
    assert_eq!(store.row_count("films").await, 0);
}

#[tokio::test]
async fn custom_prefix_is_used_for_every_request() {
    let source = FixtureSource::default().with("/obras/v4/generos", json!([]));
    let store = MemoryStore::new();

    let summary = CatalogEtl::new(&source, &store)
        .with_endpoints(cine_sync::CatalogEndpoints::new("/obras/v4"))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.genres, 0);
    assert_eq!(source.requests_for("/obras/v4/generos"), 1);
}
