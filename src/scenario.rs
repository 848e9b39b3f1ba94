use std::ops::RangeInclusive;

use log::{debug, info, warn};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::prelude::*;
use rand_distr::Uniform;

use crate::core::reference::{reference_batch, reference_dy_back};
use crate::core::{create_operator, run_operator_once, Workspace, WorkspaceError};

pub struct ScenarioConfiguration {
    pub session_length_range: RangeInclusive<usize>,
    pub relevance_grade_range: RangeInclusive<usize>,
    pub session_count_range: RangeInclusive<usize>,
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub trial_count: usize,
    pub seed: u64,
}

impl Default for ScenarioConfiguration {
    fn default() -> Self {
        Self {
            session_length_range: 1..=20,
            relevance_grade_range: 2..=5,
            session_count_range: 3..=5,
            relative_tolerance: 1e-5,
            absolute_tolerance: 1e-6,
            trial_count: 100,
            seed: 0,
        }
    }
}

/// A batch of equal-length sessions with random scores and relevance grades.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub y: Array1<f32>,
    pub r: Array1<f32>,
    pub session_lengths: Array1<i32>,
    pub dloss: Array1<f32>,
}

impl Scenario {
    pub fn generate<R: Rng>(configuration: &ScenarioConfiguration, rng: &mut R) -> Self {
        let n = rng.gen_range(configuration.session_length_range.clone());
        let k = rng.gen_range(configuration.relevance_grade_range.clone());
        let m = rng.gen_range(configuration.session_count_range.clone());
        let y = Array1::random_using(n * m, Uniform::new(0f32, 1f32), rng);
        let r = Array1::random_using(n * m, Uniform::new(0, k as i32), rng).mapv(|grade| grade as f32);
        let dloss = Array1::random_using(m, Uniform::new(0f32, 1f32), rng);
        Self {
            y,
            r,
            session_lengths: Array1::from_elem(m, n as i32),
            dloss,
        }
    }

    pub fn session_count(&self) -> usize {
        self.session_lengths.len()
    }

    fn lengths(&self) -> Vec<usize> {
        self.session_lengths
            .iter()
            .map(|&length| length.max(0) as usize)
            .collect()
    }

    pub fn load(&self, workspace: &mut Workspace) {
        workspace.set("y", self.y.clone());
        workspace.set("r", self.r.clone());
        workspace.set("session_lengths", self.session_lengths.clone());
        workspace.set("dloss", self.dloss.clone());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mismatch {
    pub output: String,
    pub index: usize,
    pub expected: f64,
    pub actual: f32,
}

#[derive(Clone, Debug, Default)]
pub struct ScenarioReport {
    pub item_count: usize,
    pub session_count: usize,
    pub largest_deviation: f64,
    pub mismatches: Vec<Mismatch>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    fn compare(
        &mut self,
        configuration: &ScenarioConfiguration,
        output: &str,
        actual: &ArrayD<f32>,
        expected: ArrayView1<f64>,
    ) -> Result<(), WorkspaceError> {
        if actual.shape() != expected.shape() {
            return Err(WorkspaceError::ShapeMismatch {
                operator: "scenario check".to_owned(),
                message: format!(
                    "{} has shape {:?}, reference has {:?}",
                    output,
                    actual.shape(),
                    expected.shape()
                ),
            });
        }
        for (index, (&actual, &expected)) in actual.iter().zip(expected.iter()).enumerate() {
            let deviation = (f64::from(actual) - expected).abs();
            self.largest_deviation = self.largest_deviation.max(deviation);
            let allowed =
                configuration.absolute_tolerance + configuration.relative_tolerance * expected.abs();
            if deviation > allowed || deviation.is_nan() {
                self.mismatches.push(Mismatch {
                    output: output.to_owned(),
                    index,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Runs both loss variants and the gradient operator against a fresh load of
/// the scenario and compares every output with the reference.
pub fn run_scenario(
    scenario: &Scenario,
    configuration: &ScenarioConfiguration,
    workspace: &mut Workspace,
) -> Result<ScenarioReport, WorkspaceError> {
    let lengths = scenario.lengths();
    let reference = reference_batch(scenario.y.view(), scenario.r.view(), &lengths);
    let mut report = ScenarioReport {
        item_count: scenario.y.len(),
        session_count: scenario.session_count(),
        ..Default::default()
    };

    scenario.load(workspace);
    for (use_ndcg_as_loss, expected_loss) in [(false, &reference.loss), (true, &reference.ndcg_loss)]
    {
        let op = create_operator(
            "LambdaRankNdcg",
            &["y", "r", "session_lengths"],
            &["loss", "dy"],
            vec![("use_ndcg_as_loss", use_ndcg_as_loss.into())],
        );
        run_operator_once(workspace, &op)?;
        let loss_label = if use_ndcg_as_loss { "ndcg_loss" } else { "loss" };
        report.compare(
            configuration,
            loss_label,
            workspace.float("loss")?,
            expected_loss.view(),
        )?;
        report.compare(configuration, "dy", workspace.float("dy")?, reference.dy.view())?;
    }

    let op = create_operator(
        "LambdaRankNdcgGradient",
        &["y", "session_lengths", "dy", "dloss"],
        &["dy_back"],
        vec![],
    );
    run_operator_once(workspace, &op)?;
    let expected_dy_back = reference_dy_back(reference.dy.view(), scenario.dloss.view(), &lengths);
    report.compare(
        configuration,
        "dy_back",
        workspace.float("dy_back")?,
        expected_dy_back.view(),
    )?;

    debug!(
        "{} sessions of {} items: largest deviation {:e}",
        report.session_count,
        report.item_count / report.session_count.max(1),
        report.largest_deviation
    );
    Ok(report)
}

pub fn run_trials(
    configuration: &ScenarioConfiguration,
) -> Result<Vec<ScenarioReport>, WorkspaceError> {
    let mut rng = StdRng::seed_from_u64(configuration.seed);
    let mut reports = Vec::with_capacity(configuration.trial_count);
    for trial in 0..configuration.trial_count {
        let scenario = Scenario::generate(configuration, &mut rng);
        let mut workspace = Workspace::new();
        let report = run_scenario(&scenario, configuration, &mut workspace)?;
        if !report.passed() {
            warn!(
                "trial {}: {} mismatches, first {:?}",
                trial,
                report.mismatches.len(),
                report.mismatches[0]
            );
        }
        reports.push(report);
    }
    let failures = reports.iter().filter(|report| !report.passed()).count();
    let largest_deviation = reports
        .iter()
        .map(|report| report.largest_deviation)
        .fold(0., f64::max);
    info!(
        "{} trials, {} failed, largest deviation {:e}",
        reports.len(),
        failures,
        largest_deviation
    );
    Ok(reports)
}
