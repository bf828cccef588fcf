use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{errors::CartValidationError, models::CartItem};

/// Client-held list of pending selections. Holds each product at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    items: Vec<CartItem>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item` unless the product is already in the cart. Returns whether
    /// it was added.
    pub fn add(&mut self, item: CartItem) -> bool {
        if self.contains(&item.product_id) {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn remove(&mut self, product_id: &str) -> Option<CartItem> {
        let index = self
            .items
            .iter()
            .position(|item| item.product_id == product_id)?;
        Some(self.items.remove(index))
    }

    pub fn contains(&self, product_id: &str) -> bool {
        self.items.iter().any(|item| item.product_id == product_id)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_minor_units(&self) -> i64 {
        self.items.iter().map(|item| item.unit_price_minor_units).sum()
    }

    pub fn into_items(self) -> Vec<CartItem> {
        self.items
    }
}

impl FromIterator<CartItem> for Cart {
    fn from_iter<T: IntoIterator<Item = CartItem>>(iter: T) -> Self {
        let mut cart = Cart::new();
        for item in iter {
            cart.add(item);
        }
        cart
    }
}

/// Shape checks that need no catalog: non-empty, one line per product
pub fn validate_cart_shape(items: &[CartItem]) -> Result<(), CartValidationError> {
    if items.is_empty() {
        return Err(CartValidationError::EmptyCart);
    }
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.product_id.as_str()) {
            return Err(CartValidationError::DuplicateItem {
                product_id: item.product_id.clone(),
            });
        }
    }
    Ok(())
}
