use crate::structs::{DriftError, FeatureMatrix, InjectionSequence, Result, SampleSet};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::collections::{BTreeSet, HashSet};

impl FeatureMatrix {
    /// Build a matrix from column identifiers and row-major data
    ///
    /// # Errors
    /// Returns `InvalidInput` if the column count does not match, identifiers
    /// repeat, or any intensity is not finite
    pub fn new(ids: Vec<String>, data: Array2<f64>) -> Result<Self> {
        if data.ncols() != ids.len() {
            return Err(DriftError::InvalidInput(format!(
                "{} feature ids for {} columns",
                ids.len(),
                data.ncols()
            )));
        }

        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(DriftError::InvalidInput(format!("Duplicate feature id '{id}'")));
            }
        }

        if data.iter().any(|v| !v.is_finite()) {
            return Err(DriftError::InvalidInput(
                "Feature intensities must be finite".into(),
            ));
        }

        Ok(Self { ids, data })
    }

    /// Build a matrix from one `Vec` per injection
    ///
    /// # Errors
    /// Returns `InvalidInput` if rows are ragged or `new` rejects the data
    pub fn from_rows(ids: Vec<String>, rows: &[Vec<f64>]) -> Result<Self> {
        let n_features = ids.len();
        if let Some(bad) = rows.iter().position(|r| r.len() != n_features) {
            return Err(DriftError::InvalidInput(format!(
                "Row {bad} has {} values, expected {n_features}",
                rows[bad].len()
            )));
        }

        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let data = Array2::from_shape_vec((rows.len(), n_features), flat)
            .map_err(|e| DriftError::Ml(format!("Failed to create array: {e}")))?;
        Self::new(ids, data)
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Number of injections (rows)
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of features (columns)
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.ids.len()
    }

    /// Same identifiers in the same order
    #[must_use]
    pub fn same_features(&self, other: &Self) -> bool {
        self.ids == other.ids
    }

    /// Keep only the listed columns, in the given order
    #[must_use]
    pub fn select_columns(&self, columns: &[usize]) -> Self {
        Self {
            ids: columns.iter().map(|&c| self.ids[c].clone()).collect(),
            data: self.data.select(Axis(1), columns),
        }
    }

    /// Reorder rows
    #[must_use]
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            ids: self.ids.clone(),
            data: self.data.select(Axis(0), rows),
        }
    }

    /// Keep the columns whose identifier is in `retained`, preserving column order
    #[must_use]
    pub fn project(&self, retained: &BTreeSet<String>) -> Self {
        let columns: Vec<usize> = self
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| retained.contains(*id))
            .map(|(i, _)| i)
            .collect();
        self.select_columns(&columns)
    }

    /// Copy with `columns` multiplied row-wise by `row_factors`
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if there is not one factor per row
    pub fn scale_columns(&self, columns: &[usize], row_factors: &Array1<f64>) -> Result<Self> {
        if row_factors.len() != self.n_rows() {
            return Err(DriftError::DimensionMismatch(format!(
                "{} correction factors for {} rows",
                row_factors.len(),
                self.n_rows()
            )));
        }

        let mut data = self.data.clone();
        for &c in columns {
            let mut col = data.column_mut(c);
            col *= row_factors;
        }
        Ok(Self {
            ids: self.ids.clone(),
            data,
        })
    }

    /// Divide every column by its root mean square (uncentred scaling)
    ///
    /// Columns that are entirely zero are left unchanged.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scale_by_rms(&self) -> Self {
        let n = self.n_rows().max(1) as f64;
        let mut data = self.data.clone();
        for mut col in data.columns_mut() {
            let rms = (col.iter().map(|v| v * v).sum::<f64>() / (n - 1.0).max(1.0)).sqrt();
            if rms > 0.0 {
                col /= rms;
            }
        }
        Self {
            ids: self.ids.clone(),
            data,
        }
    }
}

impl InjectionSequence {
    #[must_use]
    pub fn new(injections: Vec<i64>) -> Self {
        Self(injections)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.0.windows(2).all(|w| w[0] <= w[1])
    }

    #[must_use]
    pub fn min(&self) -> Option<i64> {
        self.0.iter().copied().min()
    }

    #[must_use]
    pub fn max(&self) -> Option<i64> {
        self.0.iter().copied().max()
    }

    /// Row order that sorts the sequence; stable for repeated indices
    #[must_use]
    pub fn sort_permutation(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.0.len()).collect();
        order.sort_by_key(|&i| self.0[i]);
        order
    }
}

impl SampleSet {
    /// Pair a feature matrix with its injection order
    ///
    /// # Errors
    /// Returns `InvalidInput` if the row count differs from the number of
    /// injections or the matrix is empty
    pub fn new(features: FeatureMatrix, injections: InjectionSequence) -> Result<Self> {
        if features.n_rows() != injections.len() {
            return Err(DriftError::InvalidInput(format!(
                "{} rows but {} injections",
                features.n_rows(),
                injections.len()
            )));
        }
        if features.n_rows() == 0 || features.n_features() == 0 {
            return Err(DriftError::InvalidInput(
                "Sample set needs at least one injection and one feature".into(),
            ));
        }

        Ok(Self {
            features,
            injections,
            groups: None,
        })
    }

    /// Attach sample-group labels, one per injection
    ///
    /// # Errors
    /// Returns `InvalidInput` on a length mismatch
    pub fn with_groups(mut self, groups: Vec<String>) -> Result<Self> {
        if groups.len() != self.injections.len() {
            return Err(DriftError::InvalidInput(format!(
                "{} group labels for {} injections",
                groups.len(),
                self.injections.len()
            )));
        }
        self.groups = Some(groups);
        Ok(self)
    }

    #[must_use]
    pub fn features(&self) -> &FeatureMatrix {
        &self.features
    }

    #[must_use]
    pub fn injections(&self) -> &InjectionSequence {
        &self.injections
    }

    #[must_use]
    pub fn groups(&self) -> Option<&[String]> {
        self.groups.as_deref()
    }

    /// Same rows with the matrix replaced, e.g. after correction
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the row count changes
    pub fn with_features(&self, features: FeatureMatrix) -> Result<Self> {
        if features.n_rows() != self.injections.len() {
            return Err(DriftError::DimensionMismatch(format!(
                "{} rows for {} injections",
                features.n_rows(),
                self.injections.len()
            )));
        }
        Ok(Self {
            features,
            injections: self.injections.clone(),
            groups: self.groups.clone(),
        })
    }

    /// Keep the features in `retained`; rows, injections and groups are unchanged
    #[must_use]
    pub fn project(&self, retained: &BTreeSet<String>) -> Self {
        Self {
            features: self.features.project(retained),
            injections: self.injections.clone(),
            groups: self.groups.clone(),
        }
    }

    /// Sort rows, group labels and injections together by injection order
    #[must_use]
    pub fn sorted(self) -> Self {
        if self.injections.is_sorted() {
            return self;
        }

        log::warn!(
            "Injections are not in ascending order; re-sorting {} rows",
            self.injections.len()
        );
        let order = self.injections.sort_permutation();
        Self {
            features: self.features.select_rows(&order),
            injections: InjectionSequence(order.iter().map(|&i| self.injections.0[i]).collect()),
            groups: self
                .groups
                .map(|g| order.iter().map(|&i| g[i].clone()).collect()),
        }
    }
}
