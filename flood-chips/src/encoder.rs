//! One-hot encoding of the categorical land-cover band.

use std::collections::BTreeSet;

use ndarray::{Array4, ArrayView3};

use crate::error::{ChipError, Result};

/// Maps land-cover classes to indicator channels.
///
/// Classes are compared as integers; land-cover rasters hold integral class
/// codes even when stored as floats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneHotEncoder {
    categories: Vec<i64>,
    other_bucket: bool,
}

impl OneHotEncoder {
    /// Vocabulary = sorted distinct classes in `values`.
    pub fn fit<'a>(values: impl IntoIterator<Item = &'a f32>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for &v in values {
            seen.insert(category_key(v)?);
        }
        if seen.is_empty() {
            return Err(ChipError::Encoder("cannot fit on empty land-cover data".into()));
        }
        Ok(Self {
            categories: seen.into_iter().collect(),
            other_bucket: false,
        })
    }

    /// Fixed vocabulary. With `other_bucket`, unseen classes go to one extra
    /// trailing channel; without it they are an error at transform time.
    pub fn with_vocabulary(vocabulary: &[i64], other_bucket: bool) -> Result<Self> {
        let categories: Vec<i64> = vocabulary.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if categories.is_empty() && !other_bucket {
            return Err(ChipError::Encoder("empty vocabulary without an other bucket".into()));
        }
        Ok(Self { categories, other_bucket })
    }

    pub fn categories(&self) -> &[i64] {
        &self.categories
    }

    pub fn has_other_bucket(&self) -> bool {
        self.other_bucket
    }

    /// Number of output channels.
    pub fn width(&self) -> usize {
        self.categories.len() + usize::from(self.other_bucket)
    }

    pub fn channel_of(&self, value: f32) -> Result<usize> {
        let key = category_key(value)?;
        match self.categories.binary_search(&key) {
            Ok(i) => Ok(i),
            Err(_) if self.other_bucket => Ok(self.categories.len()),
            Err(_) => Err(ChipError::Encoder(format!(
                "land-cover class {} is not in the vocabulary {:?}",
                key, self.categories
            ))),
        }
    }

    /// `[N, H, W]` classes into `[N, K, H, W]` indicators.
    pub fn transform(&self, landcover: ArrayView3<f32>) -> Result<Array4<f32>> {
        let (n, h, w) = landcover.dim();
        let mut out = Array4::<f32>::zeros((n, self.width(), h, w));
        for ((i, y, x), &v) in landcover.indexed_iter() {
            let k = self.channel_of(v)?;
            out[[i, k, y, x]] = 1.0;
        }
        Ok(out)
    }
}

fn category_key(value: f32) -> Result<i64> {
    if !value.is_finite() {
        return Err(ChipError::Encoder(format!("non-finite land-cover value {}", value)));
    }
    Ok(value.round() as i64)
}
