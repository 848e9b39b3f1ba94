use std::collections::HashMap;

use lazy_static::lazy_static;
use ndarray::prelude::*;

use super::{session_ranges, Blob, OperatorDefinition, WorkspaceError};

pub(super) trait Operation {
    fn input_count(&self) -> usize;
    fn output_count(&self) -> usize;
    fn forward(&self, inputs: &[&Blob]) -> Result<Vec<Blob>, WorkspaceError>;
}

type Constructor = fn(&OperatorDefinition) -> Result<Box<dyn Operation>, WorkspaceError>;

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, Constructor> = {
        let mut registry = HashMap::new();
        registry.insert(
            LambdaRankNdcg::TYPE_NAME,
            LambdaRankNdcg::from_definition as Constructor,
        );
        registry.insert(
            LambdaRankNdcgGradient::TYPE_NAME,
            LambdaRankNdcgGradient::from_definition as Constructor,
        );
        registry
    };
}

pub fn registered_operators() -> Vec<&'static str> {
    let mut names = REGISTRY.keys().copied().collect::<Vec<_>>();
    names.sort();
    names
}

pub(super) fn instantiate(
    definition: &OperatorDefinition,
) -> Result<Box<dyn Operation>, WorkspaceError> {
    let constructor = REGISTRY
        .get(definition.type_name())
        .ok_or_else(|| WorkspaceError::UnknownOperator(definition.type_name().to_owned()))?;
    constructor(definition)
}

fn vector<'a>(
    operator: &str,
    role: &str,
    blob: &'a Blob,
) -> Result<ArrayView1<'a, f32>, WorkspaceError> {
    blob.as_float(role)?
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| WorkspaceError::ShapeMismatch {
            operator: operator.to_owned(),
            message: format!("{} should be one-dimensional, got shape {:?}", role, blob.shape()),
        })
}

fn expect_length(
    operator: &str,
    role: &str,
    actual: usize,
    expected: usize,
) -> Result<(), WorkspaceError> {
    if actual != expected {
        return Err(WorkspaceError::ShapeMismatch {
            operator: operator.to_owned(),
            message: format!("{} has length {}, expected {}", role, actual, expected),
        });
    }
    Ok(())
}

fn session_lengths(
    operator: &str,
    blob: &Blob,
    item_count: usize,
) -> Result<Vec<usize>, WorkspaceError> {
    let lengths = blob.as_integer("session_lengths")?;
    if lengths.ndim() != 1 {
        return Err(WorkspaceError::SessionLengths {
            operator: operator.to_owned(),
            message: format!("expected a vector, got shape {:?}", lengths.shape()),
        });
    }
    let mut converted = Vec::with_capacity(lengths.len());
    for &length in lengths.iter() {
        let length = usize::try_from(length).map_err(|_| WorkspaceError::SessionLengths {
            operator: operator.to_owned(),
            message: format!("negative length {}", length),
        })?;
        converted.push(length);
    }
    let total: usize = converted.iter().sum();
    if total != item_count {
        return Err(WorkspaceError::SessionLengths {
            operator: operator.to_owned(),
            message: format!("lengths sum to {} but there are {} items", total, item_count),
        });
    }
    Ok(converted)
}

/// Rank discounts 1/log₂(rank + 2), rank 0 going to the highest value. Ties
/// are ranked higher-index-first.
fn rank_discounts(values: ArrayView1<f64>) -> Array1<f64> {
    let mut ranking = (0..values.len()).collect::<Vec<_>>();
    ranking.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.cmp(&a))
    });
    let mut discounts = Array1::zeros(values.len());
    for (rank, &index) in ranking.iter().enumerate() {
        discounts[index] = 1. / ((rank + 2) as f64).log2();
    }
    discounts
}

/// One session's loss and score gradient, with the pairwise terms laid out
/// as n×n matrices indexed by (i, j).
fn session_forward(
    y: ArrayView1<f32>,
    r: ArrayView1<f32>,
    use_ndcg_as_loss: bool,
) -> (f64, Array1<f64>) {
    let n = y.len();
    let y = y.mapv(f64::from);
    let r = r.mapv(f64::from);
    if r.mapv(f64::abs).sum() < 1e-6 {
        return (0., Array1::zeros(n));
    }

    let gains = r.mapv(|relevance| 2f64.powf(relevance));
    let idcg = gains.dot(&rank_discounts(r.view())).max(1e-5);
    let discounts = rank_discounts(y.view());

    // The diagonal has zero gain difference, so it drops out of both sums.
    let lambda_weights = Array2::from_shape_fn((n, n), |(i, j)| {
        (gains[i] - gains[j]).abs() * (discounts[i] - discounts[j]).abs()
    });
    let score_gaps = Array2::from_shape_fn((n, n), |(i, j)| y[i] - y[j]);
    let preferences = Array2::from_shape_fn((n, n), |(i, j)| r[i] > r[j]);

    let mut rank_losses = Array2::<f64>::zeros((n, n));
    let mut rank_dys = Array2::<f64>::zeros((n, n));
    azip!((rank_loss in &mut rank_losses, rank_dy in &mut rank_dys, &gap in &score_gaps, &preferred in &preferences) {
        let higher = if preferred { gap } else { -gap };
        // −log σ(h) = log(1 + e^(−h))
        *rank_loss = (-higher).exp().ln_1p();
        let target = if preferred { 0. } else { 1. };
        *rank_dy = target - 1. / (1. + gap.exp());
    });

    let loss = if use_ndcg_as_loss {
        1. - gains.dot(&discounts) / idcg
    } else {
        (&lambda_weights * &rank_losses).sum() / idcg
    };
    let dy = (&lambda_weights * &rank_dys).sum_axis(Axis(1)) / idcg;
    (loss, dy)
}

/// Forward kernel over a flattened batch: per-session losses and per-item
/// score gradients.
pub fn lambda_rank_ndcg(
    y: ArrayView1<f32>,
    r: ArrayView1<f32>,
    session_lengths: &[usize],
    use_ndcg_as_loss: bool,
) -> (Array1<f32>, Array1<f32>) {
    let mut loss = Array1::<f32>::zeros(session_lengths.len());
    let mut dy = Array1::<f32>::zeros(y.len());
    for (session, range) in session_ranges(session_lengths).into_iter().enumerate() {
        let (session_loss, session_dy) = session_forward(
            y.slice(s![range.clone()]),
            r.slice(s![range.clone()]),
            use_ndcg_as_loss,
        );
        loss[session] = session_loss as f32;
        dy.slice_mut(s![range])
            .assign(&session_dy.mapv(|x| x as f32));
    }
    (loss, dy)
}

/// Backward kernel: every item's gradient scaled by its session's upstream
/// loss gradient.
pub fn lambda_rank_ndcg_gradient(
    dy: ArrayView1<f32>,
    dloss: ArrayView1<f32>,
    session_lengths: &[usize],
) -> Array1<f32> {
    let mut dy_back = Array1::<f32>::zeros(dy.len());
    for (session, range) in session_ranges(session_lengths).into_iter().enumerate() {
        let scale = dloss[session];
        dy_back
            .slice_mut(s![range.clone()])
            .assign(&dy.slice(s![range]).mapv(|x| scale * x));
    }
    dy_back
}

pub(super) struct LambdaRankNdcg {
    use_ndcg_as_loss: bool,
}

impl LambdaRankNdcg {
    pub const TYPE_NAME: &'static str = "LambdaRankNdcg";

    fn from_definition(
        definition: &OperatorDefinition,
    ) -> Result<Box<dyn Operation>, WorkspaceError> {
        Ok(Box::new(LambdaRankNdcg {
            use_ndcg_as_loss: definition.bool_attribute("use_ndcg_as_loss", false)?,
        }))
    }
}

impl Operation for LambdaRankNdcg {
    fn input_count(&self) -> usize {
        3
    }

    fn output_count(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[&Blob]) -> Result<Vec<Blob>, WorkspaceError> {
        let y = vector(Self::TYPE_NAME, "y", inputs[0])?;
        let r = vector(Self::TYPE_NAME, "r", inputs[1])?;
        expect_length(Self::TYPE_NAME, "r", r.len(), y.len())?;
        let lengths = session_lengths(Self::TYPE_NAME, inputs[2], y.len())?;
        let (loss, dy) = lambda_rank_ndcg(y, r, &lengths, self.use_ndcg_as_loss);
        Ok(vec![loss.into(), dy.into()])
    }
}

pub(super) struct LambdaRankNdcgGradient {}

impl LambdaRankNdcgGradient {
    pub const TYPE_NAME: &'static str = "LambdaRankNdcgGradient";

    fn from_definition(
        _definition: &OperatorDefinition,
    ) -> Result<Box<dyn Operation>, WorkspaceError> {
        Ok(Box::new(LambdaRankNdcgGradient {}))
    }
}

impl Operation for LambdaRankNdcgGradient {
    fn input_count(&self) -> usize {
        4
    }

    fn output_count(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[&Blob]) -> Result<Vec<Blob>, WorkspaceError> {
        // y only pins down the item count
        let y = vector(Self::TYPE_NAME, "y", inputs[0])?;
        let lengths = session_lengths(Self::TYPE_NAME, inputs[1], y.len())?;
        let dy = vector(Self::TYPE_NAME, "dy", inputs[2])?;
        expect_length(Self::TYPE_NAME, "dy", dy.len(), y.len())?;
        let dloss = vector(Self::TYPE_NAME, "dloss", inputs[3])?;
        expect_length(Self::TYPE_NAME, "dloss", dloss.len(), lengths.len())?;
        Ok(vec![lambda_rank_ndcg_gradient(dy, dloss, &lengths).into()])
    }
}
