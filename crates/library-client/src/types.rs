//! Wire types returned by the library service

use serde::Deserialize;

/// A page of results from a paginated library endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u32,
    pub page: u32,
    pub size: u32,
    pub pages: u32,
}

/// Minimal book listing used for crawling: id plus the formats it offers
#[derive(Debug, Clone, Deserialize)]
pub struct BaseBook {
    pub id: i32,
    pub available_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub id: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookAuthor {
    pub id: u32,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub middle_name: String,
}

/// Full book record, including the coordinates needed to download it
#[derive(Debug, Clone, Deserialize)]
pub struct Book {
    pub id: i32,
    pub remote_id: u32,
    pub title: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub authors: Vec<BookAuthor>,
    pub source: Source,
    #[serde(default)]
    pub available_types: Vec<String>,
}
