//! Merging atlas label priors into mixture classes.

use nalgebra::DMatrix;
use tracing::debug;

use seg_types::ModelSpecification;

use crate::error::{AtlasError, AtlasResult};

/// Class-level node alphas produced by [`merge_alphas`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergedAlphas {
    /// Node × class probabilities.
    pub alphas: DMatrix<f64>,
    /// Class index of every atlas label, in label order.
    pub label_to_class: Vec<usize>,
    /// Class names, in class order.
    pub class_names: Vec<String>,
}

/// Sums the alpha columns of each class's labels.
///
/// Every atlas label must belong to exactly one class, so merged rows keep
/// the total probability of the original rows.
///
/// # Errors
///
/// - [`AtlasError::UnknownLabel`] if a class lists a label the atlas lacks
/// - [`AtlasError::DuplicateLabel`] if a label is listed twice
/// - [`AtlasError::UnmappedLabel`] if an atlas label belongs to no class
///
/// # Example
///
/// ```
/// use nalgebra::DMatrix;
/// use seg_atlas::merge_alphas;
/// use seg_types::{ClassSpec, ModelSpecification};
///
/// let alphas = DMatrix::from_row_slice(2, 3, &[0.2, 0.3, 0.5, 1.0, 0.0, 0.0]);
/// let labels = ["bg", "wm", "gm"].map(String::from);
/// let model = ModelSpecification::new(vec![
///     ClassSpec::new("background", ["bg"], 1),
///     ClassSpec::new("brain", ["wm", "gm"], 2),
/// ]);
///
/// let merged = merge_alphas(&alphas, &labels, &model).unwrap();
/// assert_eq!(merged.label_to_class, vec![0, 1, 1]);
/// assert!((merged.alphas[(0, 1)] - 0.8).abs() < 1e-12);
/// ```
pub fn merge_alphas(
    alphas: &DMatrix<f64>,
    label_names: &[String],
    model: &ModelSpecification,
) -> AtlasResult<MergedAlphas> {
    if alphas.ncols() != label_names.len() {
        return Err(AtlasError::InvalidMesh(format!(
            "{} alpha columns for {} label names",
            alphas.ncols(),
            label_names.len()
        )));
    }

    let mut label_to_class: Vec<Option<usize>> = vec![None; label_names.len()];
    for (class_index, class) in model.classes.iter().enumerate() {
        for label in &class.label_names {
            let Some(column) = label_names.iter().position(|name| name == label) else {
                return Err(AtlasError::UnknownLabel {
                    class: class.name.clone(),
                    label: label.clone(),
                });
            };
            if label_to_class[column].replace(class_index).is_some() {
                return Err(AtlasError::DuplicateLabel {
                    label: label.clone(),
                });
            }
        }
    }

    let label_to_class = label_to_class
        .into_iter()
        .zip(label_names)
        .map(|(class, name)| class.ok_or_else(|| AtlasError::UnmappedLabel { label: name.clone() }))
        .collect::<AtlasResult<Vec<_>>>()?;

    let mut merged = DMatrix::zeros(alphas.nrows(), model.class_count());
    for (column, &class) in label_to_class.iter().enumerate() {
        let mut target = merged.column_mut(class);
        target += alphas.column(column);
    }
    debug!(
        labels = label_names.len(),
        classes = model.class_count(),
        "merged atlas labels into classes"
    );

    Ok(MergedAlphas {
        alphas: merged,
        label_to_class,
        class_names: model.classes.iter().map(|c| c.name.clone()).collect(),
    })
}
