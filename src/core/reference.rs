//! Plain-loop rendition of the LambdaRank NDCG loss, written for
//! readability rather than speed. The operator kernels are checked against
//! it.

use std::cmp::Ordering;

use ndarray::prelude::*;
use num_traits::Float;

use super::session_ranges;

fn constant<F: Float>(x: f64) -> F {
    F::from(x).expect("constant should be representable")
}

pub fn sigmoid<F: Float>(x: F) -> F {
    F::one() / (F::one() + (-x).exp())
}

pub fn log_sigmoid<F: Float>(x: F) -> F {
    -(-x).exp().ln_1p()
}

fn gain<F: Float>(relevance: F) -> F {
    constant::<F>(2.).powf(relevance)
}

/// The item at ascending sort position i (0 being the smallest value) is
/// discounted by 1/log₂(n − i + 1), so the largest value gets 1.
pub fn discounts<F: Float>(values: ArrayView1<F>) -> Array1<F> {
    let n = values.len();
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(Ordering::Equal)
    });
    let mut discounts = Array1::zeros(n);
    for (position, &index) in order.iter().enumerate() {
        discounts[index] = F::one() / constant::<F>((n - position + 1) as f64).log2();
    }
    discounts
}

/// Loss and its gradient with respect to the scores `y` for one session.
pub fn lambda_rank_loss<F: Float>(
    y: ArrayView1<F>,
    r: ArrayView1<F>,
    use_ndcg_as_loss: bool,
) -> (F, Array1<F>) {
    let n = y.len();
    let mut dy = Array1::zeros(n);
    let mut loss = F::zero();
    if r.iter().fold(F::zero(), |sum, r_i| sum + r_i.abs()) < constant(1e-6) {
        return (loss, dy);
    }

    let g = r.mapv(gain);
    let ideal_discounts = discounts(r);
    let mut idcg = F::zero();
    for i in 0..n {
        idcg = idcg + g[i] * ideal_discounts[i];
    }
    if idcg < constant(1e-5) {
        idcg = constant(1e-5);
    }

    let d = discounts(y);
    if use_ndcg_as_loss {
        let mut dcg = F::zero();
        for i in 0..n {
            dcg = dcg + g[i] * d[i];
        }
        loss = F::one() - dcg / idcg;
    }

    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let lambda_weight = (g[i] - g[j]).abs() * (d[i] - d[j]).abs();
            let higher = if r[i] > r[j] { y[i] - y[j] } else { y[j] - y[i] };
            let rank_loss = -log_sigmoid(higher);
            let preferred = if r[i] > r[j] { F::zero() } else { F::one() };
            let rank_dy = preferred - sigmoid(-y[i] + y[j]);
            if !use_ndcg_as_loss {
                loss = loss + lambda_weight * rank_loss / idcg;
            }
            dy[i] = dy[i] + lambda_weight * rank_dy / idcg;
        }
    }
    (loss, dy)
}

/// Reference outputs for a whole batch of sessions.
#[derive(Clone, Debug)]
pub struct ReferenceBatch {
    pub loss: Array1<f64>,
    pub ndcg_loss: Array1<f64>,
    pub dy: Array1<f64>,
}

pub fn reference_batch(
    y: ArrayView1<f32>,
    r: ArrayView1<f32>,
    session_lengths: &[usize],
) -> ReferenceBatch {
    let y = y.mapv(f64::from);
    let r = r.mapv(f64::from);
    let mut loss = Vec::with_capacity(session_lengths.len());
    let mut ndcg_loss = Vec::with_capacity(session_lengths.len());
    let mut dy = Vec::with_capacity(y.len());
    for range in session_ranges(session_lengths) {
        let session_y = y.slice(s![range.clone()]);
        let session_r = r.slice(s![range]);
        let (session_loss, session_dy) = lambda_rank_loss(session_y, session_r, false);
        let (session_ndcg_loss, _) = lambda_rank_loss(session_y, session_r, true);
        loss.push(session_loss);
        ndcg_loss.push(session_ndcg_loss);
        dy.extend(session_dy.iter().copied());
    }
    ReferenceBatch {
        loss: Array1::from(loss),
        ndcg_loss: Array1::from(ndcg_loss),
        dy: Array1::from(dy),
    }
}

/// Chain rule: each session's gradient scaled by its upstream loss gradient.
pub fn reference_dy_back(
    dy: ArrayView1<f64>,
    dloss: ArrayView1<f32>,
    session_lengths: &[usize],
) -> Array1<f64> {
    let mut dy_back = Array1::<f64>::zeros(dy.len());
    for (session, range) in session_ranges(session_lengths).into_iter().enumerate() {
        let scale = f64::from(dloss[session]);
        dy_back
            .slice_mut(s![range.clone()])
            .assign(&dy.slice(s![range]).mapv(|x| scale * x));
    }
    dy_back
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_discounts() {
        let d = discounts(array![0.1, 0.9, 0.5].view());
        assert_abs_diff_eq!(
            d,
            array![0.5, 1.0, 1. / 3f64.log2()],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_single_item_discount() {
        assert_eq!(discounts(array![7.0].view()), array![1.0]);
    }

    #[test]
    fn test_discounts_depend_only_on_order() {
        let v = array![0.3, -1.2, 4.0, 0.0, 2.5];
        let transformed = v.mapv(|x: f64| 3. * x.exp() + 7.);
        assert_eq!(discounts(v.view()), discounts(transformed.view()));
    }

    #[test]
    fn test_irrelevant_session_is_zero() {
        let y = array![0.4, 0.1, 0.9];
        let r = array![0.0, 0.0, 0.0];
        for use_ndcg_as_loss in [false, true] {
            let (loss, dy) = lambda_rank_loss(y.view(), r.view(), use_ndcg_as_loss);
            assert_eq!(loss, 0.);
            assert_eq!(dy, array![0.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn test_single_item_session() {
        let (loss, dy) = lambda_rank_loss(array![0.3].view(), array![2.0].view(), false);
        assert_eq!(loss, 0.);
        assert_eq!(dy, array![0.0]);

        // dcg equals idcg when there is nothing to misorder
        let (ndcg_loss, _) = lambda_rank_loss(array![0.3].view(), array![2.0].view(), true);
        assert_abs_diff_eq!(ndcg_loss, 0., epsilon = 1e-12);
    }

    #[test]
    fn test_two_item_session() {
        let y = array![0.5, -0.3];
        let r = array![1.0, 0.0];
        let (loss, dy) = lambda_rank_loss(y.view(), r.view(), false);
        assert_abs_diff_eq!(loss, 0.10411696780973939, epsilon = 1e-12);
        assert_abs_diff_eq!(
            dy,
            array![-0.043490782866415695, 0.04349078286641569],
            epsilon = 1e-12
        );

        // already ideally ordered
        let (ndcg_loss, ndcg_dy) = lambda_rank_loss(y.view(), r.view(), true);
        assert_abs_diff_eq!(ndcg_loss, 0., epsilon = 1e-12);
        assert_abs_diff_eq!(ndcg_dy, dy, epsilon = 1e-12);
    }

    #[test]
    fn test_three_item_session() {
        let y = array![0.9, 0.1, 0.4];
        let r = array![0.0, 2.0, 1.0];
        let (loss, dy) = lambda_rank_loss(y.view(), r.view(), false);
        assert_abs_diff_eq!(loss, 0.812194352137245, epsilon = 1e-12);
        assert_abs_diff_eq!(
            dy,
            array![0.21949388715257748, -0.2057295834020504, -0.013764303750527104],
            epsilon = 1e-12
        );
        let (ndcg_loss, _) = lambda_rank_loss(y.view(), r.view(), true);
        assert_abs_diff_eq!(ndcg_loss, 0.2603326231992408, epsilon = 1e-12);
    }

    #[test]
    fn test_tied_relevance_contributes_nothing() {
        let (loss, dy) = lambda_rank_loss(array![0.3, 0.8].view(), array![1.0, 1.0].view(), false);
        assert_eq!(loss, 0.);
        assert_eq!(dy, array![0.0, 0.0]);
    }

    #[test]
    fn test_single_precision_agrees() {
        let (loss, dy) =
            lambda_rank_loss(array![0.5f32, -0.3].view(), array![1.0f32, 0.0].view(), false);
        assert_abs_diff_eq!(loss, 0.10411697f32, epsilon = 1e-6);
        assert_abs_diff_eq!(dy, array![-0.04349078f32, 0.04349078], epsilon = 1e-6);
    }

    #[test]
    fn test_sigmoid_forms() {
        assert_abs_diff_eq!(sigmoid(0.0f64), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(log_sigmoid(0.0f64), -(2f64.ln()), epsilon = 1e-15);
        for x in [-3.0f64, -0.2, 0.7, 5.0] {
            assert_abs_diff_eq!(log_sigmoid(x), sigmoid(x).ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_reference_batch() {
        let y = array![0.5f32, -0.3, 0.9, 0.1, 0.4];
        let r = array![1.0f32, 0.0, 0.0, 2.0, 1.0];
        let batch = reference_batch(y.view(), r.view(), &[2, 3]);

        let first = lambda_rank_loss(
            y.slice(s![..2]).mapv(f64::from).view(),
            r.slice(s![..2]).mapv(f64::from).view(),
            false,
        );
        assert_eq!(batch.loss.len(), 2);
        assert_eq!(batch.ndcg_loss.len(), 2);
        assert_eq!(batch.dy.len(), 5);
        assert_abs_diff_eq!(batch.loss[0], first.0, epsilon = 1e-12);
        assert_abs_diff_eq!(batch.dy.slice(s![..2]), first.1, epsilon = 1e-12);
        assert_abs_diff_eq!(batch.loss[1], 0.812194352137245, epsilon = 1e-6);
        assert_abs_diff_eq!(batch.ndcg_loss[1], 0.2603326231992408, epsilon = 1e-6);
    }

    #[test]
    fn test_reference_dy_back_scales_per_session() {
        let dy = array![1.0, -2.0, 0.5, 4.0];
        let dloss = array![0.5f32, 2.0];
        let dy_back = reference_dy_back(dy.view(), dloss.view(), &[3, 1]);
        assert_abs_diff_eq!(dy_back, array![0.5, -1.0, 0.25, 8.0], epsilon = 1e-12);
    }
}
