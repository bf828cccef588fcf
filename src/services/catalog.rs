use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{
    sea_query::OnConflict, DatabaseConnection, EntityTrait, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::{entities::product, errors::ServiceError};

/// What checkout needs to know about a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub product_id: String,
    pub seller_id: String,
    pub price_minor_units: i64,
    pub currency: String,
    pub available: bool,
}

impl CatalogProduct {
    pub fn new(
        product_id: impl Into<String>,
        seller_id: impl Into<String>,
        price_minor_units: i64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            seller_id: seller_id.into(),
            price_minor_units,
            currency: currency.into(),
            available: true,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

impl From<product::Model> for CatalogProduct {
    fn from(model: product::Model) -> Self {
        Self {
            product_id: model.product_id,
            seller_id: model.seller_id,
            price_minor_units: model.price_minor_units,
            currency: model.currency,
            available: model.available,
        }
    }
}

/// Read-only product lookup used by checkout
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn get_product(&self, product_id: &str) -> Result<Option<CatalogProduct>, ServiceError>;
}

/// Reads the `products` table
#[derive(Clone)]
pub struct DbCatalogReader {
    db: Arc<DatabaseConnection>,
}

impl DbCatalogReader {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts or refreshes a product row. Used by the CLI and tests to load
    /// the catalog projection.
    pub async fn upsert_product(
        &self,
        product: &CatalogProduct,
        title: &str,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        let model = product::ActiveModel {
            product_id: Set(product.product_id.clone()),
            seller_id: Set(product.seller_id.clone()),
            title: Set(title.to_string()),
            price_minor_units: Set(product.price_minor_units),
            currency: Set(product.currency.clone()),
            available: Set(product.available),
            created_at: Set(now),
            updated_at: Set(now),
        };

        product::Entity::insert(model)
            .on_conflict(
                OnConflict::column(product::Column::ProductId)
                    .update_columns([
                        product::Column::SellerId,
                        product::Column::Title,
                        product::Column::PriceMinorUnits,
                        product::Column::Currency,
                        product::Column::Available,
                        product::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogReader for DbCatalogReader {
    #[instrument(skip(self))]
    async fn get_product(&self, product_id: &str) -> Result<Option<CatalogProduct>, ServiceError> {
        let found = product::Entity::find_by_id(product_id.to_string())
            .one(&*self.db)
            .await?;
        Ok(found.map(CatalogProduct::from))
    }
}

/// Concurrent in-process catalog for local development and tests
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    products: Arc<DashMap<String, CatalogProduct>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = CatalogProduct>) -> Self {
        let catalog = Self::new();
        for product in products {
            catalog.put(product);
        }
        catalog
    }

    pub fn put(&self, product: CatalogProduct) {
        self.products.insert(product.product_id.clone(), product);
    }

    pub fn set_price(&self, product_id: &str, price_minor_units: i64) {
        if let Some(mut entry) = self.products.get_mut(product_id) {
            entry.price_minor_units = price_minor_units;
        }
    }
}

#[async_trait]
impl CatalogReader for InMemoryCatalog {
    async fn get_product(&self, product_id: &str) -> Result<Option<CatalogProduct>, ServiceError> {
        Ok(self.products.get(product_id).map(|entry| entry.clone()))
    }
}
