//! Range-vector functions applied to a sample window
//!
//! Each function reduces the samples of one series inside one step's window
//! to at most one value. `None` means the series is absent at that step,
//! which happens for an empty window and for the functions that need at
//! least two samples.
//!
//! # Supported Functions
//!
//! | Function             | Min samples | Notes                                   |
//! |----------------------|-------------|-----------------------------------------|
//! | `rate` / `increase`  | 2           | Extrapolated, counter resets corrected  |
//! | `delta`              | 2           | Extrapolated, gauge semantics           |
//! | `irate` / `idelta`   | 2           | Last two samples only                   |
//! | `deriv`              | 2           | Least-squares slope per second          |
//! | `predict_linear`     | 2           | Scalar argument: seconds ahead          |
//! | `quantile_over_time` | 1           | Scalar argument: quantile               |
//! | `*_over_time`        | 1           | sum, avg, min, max, count, stddev, ...  |
//! | `changes` / `resets` | 1           |                                         |

use crate::query::ast::FunctionCall;
use crate::query::error::{QueryError, QueryResult};
use crate::query::operators::numeric::{kahan_inc, KahanSum};
use crate::types::Sample;
use std::fmt;

/// Evaluation parameters for one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunctionArg {
    /// Step timestamp in milliseconds
    pub step_time: i64,
    /// Window width in milliseconds
    pub range_ms: i64,
    /// Selector offset in milliseconds
    pub offset_ms: i64,
    /// Constant scalar argument (quantile or prediction horizon), NaN if unused
    pub scalar: f64,
}

impl FunctionArg {
    /// Lower bound of the window (inclusive)
    #[inline]
    pub fn range_start(&self) -> i64 {
        self.step_time - self.offset_ms - self.range_ms
    }

    /// Upper bound of the window (inclusive)
    #[inline]
    pub fn range_end(&self) -> i64 {
        self.step_time - self.offset_ms
    }
}

/// Functions a matrix selector can apply to its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeFunction {
    /// Per-second average increase of a counter
    Rate,
    /// Total increase of a counter
    Increase,
    /// Difference between first and last value of a gauge
    Delta,
    /// Per-second rate from the last two samples
    Irate,
    /// Difference between the last two samples
    Idelta,
    /// Per-second derivative via linear regression
    Deriv,
    /// Linear prediction `scalar` seconds after the step
    PredictLinear,
    /// φ-quantile of the window values
    QuantileOverTime,
    /// Sum of the window values
    SumOverTime,
    /// Mean of the window values
    AvgOverTime,
    /// Minimum window value
    MinOverTime,
    /// Maximum window value
    MaxOverTime,
    /// Number of samples in the window
    CountOverTime,
    /// Population standard deviation
    StddevOverTime,
    /// Population variance
    StdvarOverTime,
    /// Most recent value
    LastOverTime,
    /// 1 for every series with a sample in the window
    PresentOverTime,
    /// Number of value changes
    Changes,
    /// Number of counter resets
    Resets,
}

impl RangeFunction {
    /// Resolve a function by its PromQL name
    pub fn from_name(name: &str) -> QueryResult<Self> {
        let f = match name {
            "rate" => Self::Rate,
            "increase" => Self::Increase,
            "delta" => Self::Delta,
            "irate" => Self::Irate,
            "idelta" => Self::Idelta,
            "deriv" => Self::Deriv,
            "predict_linear" => Self::PredictLinear,
            "quantile_over_time" => Self::QuantileOverTime,
            "sum_over_time" => Self::SumOverTime,
            "avg_over_time" => Self::AvgOverTime,
            "min_over_time" => Self::MinOverTime,
            "max_over_time" => Self::MaxOverTime,
            "count_over_time" => Self::CountOverTime,
            "stddev_over_time" => Self::StddevOverTime,
            "stdvar_over_time" => Self::StdvarOverTime,
            "last_over_time" => Self::LastOverTime,
            "present_over_time" => Self::PresentOverTime,
            "changes" => Self::Changes,
            "resets" => Self::Resets,
            other => {
                return Err(QueryError::not_supported(format!(
                    "unknown range function: {}",
                    other
                )))
            }
        };
        Ok(f)
    }

    /// Resolve a call node to its function and constant scalar argument
    ///
    /// The scalar is NaN for functions that take none. A scalar argument
    /// that is not a literal fails with `NotSupported`.
    pub fn from_call(call: &FunctionCall) -> QueryResult<(Self, f64)> {
        let function = Self::from_name(&call.name)?;
        let Some(index) = function.scalar_arg_index() else {
            return Ok((function, f64::NAN));
        };

        let position = if index == 0 { "first" } else { "second" };
        let arg = call.args.get(index).ok_or_else(|| {
            QueryError::validation(format!("{} is missing its {} argument", function, position))
        })?;
        let scalar = arg.unwrap_float().map_err(|e| {
            QueryError::not_supported(format!(
                "{} with expression as {} argument is not supported",
                function, position
            ))
            .with_source(e)
        })?;
        Ok((function, scalar))
    }

    /// PromQL name of the function
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::Increase => "increase",
            Self::Delta => "delta",
            Self::Irate => "irate",
            Self::Idelta => "idelta",
            Self::Deriv => "deriv",
            Self::PredictLinear => "predict_linear",
            Self::QuantileOverTime => "quantile_over_time",
            Self::SumOverTime => "sum_over_time",
            Self::AvgOverTime => "avg_over_time",
            Self::MinOverTime => "min_over_time",
            Self::MaxOverTime => "max_over_time",
            Self::CountOverTime => "count_over_time",
            Self::StddevOverTime => "stddev_over_time",
            Self::StdvarOverTime => "stdvar_over_time",
            Self::LastOverTime => "last_over_time",
            Self::PresentOverTime => "present_over_time",
            Self::Changes => "changes",
            Self::Resets => "resets",
        }
    }

    /// Position of the constant scalar argument in the call, if any
    pub fn scalar_arg_index(&self) -> Option<usize> {
        match self {
            Self::QuantileOverTime => Some(0),
            Self::PredictLinear => Some(1),
            _ => None,
        }
    }

    /// Whether output series keep their `__name__` label
    pub fn keeps_metric_name(&self) -> bool {
        matches!(self, Self::LastOverTime)
    }

    /// Reduce a window to a single value, `None` when the series is absent
    pub fn eval(&self, samples: &[Sample], arg: &FunctionArg) -> Option<f64> {
        let last = samples.last()?;
        match self {
            Self::Rate => extrapolated_rate(samples, arg, true, true),
            Self::Increase => extrapolated_rate(samples, arg, true, false),
            Self::Delta => extrapolated_rate(samples, arg, false, false),
            Self::Irate => instant_value(samples, true),
            Self::Idelta => instant_value(samples, false),
            Self::Deriv => {
                if samples.len() < 2 {
                    return None;
                }
                let (slope, _) = linear_regression(samples, samples[0].timestamp);
                Some(slope)
            }
            Self::PredictLinear => {
                if samples.len() < 2 {
                    return None;
                }
                let (slope, intercept) = linear_regression(samples, arg.step_time);
                Some(slope * arg.scalar + intercept)
            }
            Self::QuantileOverTime => Some(quantile(arg.scalar, samples)),
            Self::SumOverTime => {
                let mut sum = KahanSum::new();
                samples.iter().for_each(|s| sum.add(s.value));
                Some(sum.sum())
            }
            Self::AvgOverTime => Some(avg_kahan(samples)),
            Self::MinOverTime => Some(samples.iter().skip(1).fold(samples[0].value, |min, s| {
                if s.value < min || min.is_nan() {
                    s.value
                } else {
                    min
                }
            })),
            Self::MaxOverTime => Some(samples.iter().skip(1).fold(samples[0].value, |max, s| {
                if s.value > max || max.is_nan() {
                    s.value
                } else {
                    max
                }
            })),
            Self::CountOverTime => Some(samples.len() as f64),
            Self::StddevOverTime => Some(variance_kahan(samples).sqrt()),
            Self::StdvarOverTime => Some(variance_kahan(samples)),
            Self::LastOverTime => Some(last.value),
            Self::PresentOverTime => Some(1.0),
            Self::Changes => Some(
                samples
                    .windows(2)
                    .filter(|w| {
                        let (prev, cur) = (w[0].value, w[1].value);
                        cur != prev && !(cur.is_nan() && prev.is_nan())
                    })
                    .count() as f64,
            ),
            Self::Resets => Some(
                samples
                    .windows(2)
                    .filter(|w| w[1].value < w[0].value)
                    .count() as f64,
            ),
        }
    }
}

impl fmt::Display for RangeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Extrapolated increase over the window
///
/// The sampled interval is extrapolated towards the window edges, but only
/// by half an average sample gap when an edge is far from the nearest
/// sample, and never below zero for counters.
fn extrapolated_rate(
    samples: &[Sample],
    arg: &FunctionArg,
    is_counter: bool,
    is_rate: bool,
) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let first = samples[0];
    let last = samples[samples.len() - 1];

    let mut result = last.value - first.value;
    if is_counter {
        for w in samples.windows(2) {
            if w[1].value < w[0].value {
                result += w[0].value;
            }
        }
    }

    let mut duration_to_start = (first.timestamp - arg.range_start()) as f64 / 1000.0;
    let duration_to_end = (arg.range_end() - last.timestamp) as f64 / 1000.0;
    let sampled_interval = (last.timestamp - first.timestamp) as f64 / 1000.0;
    let avg_between_samples = sampled_interval / (samples.len() - 1) as f64;

    if is_counter && result > 0.0 && first.value >= 0.0 {
        let duration_to_zero = sampled_interval * (first.value / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let threshold = avg_between_samples * 1.1;
    let mut extrapolate_to = sampled_interval;
    extrapolate_to += if duration_to_start < threshold {
        duration_to_start
    } else {
        avg_between_samples / 2.0
    };
    extrapolate_to += if duration_to_end < threshold {
        duration_to_end
    } else {
        avg_between_samples / 2.0
    };

    result *= extrapolate_to / sampled_interval;
    if is_rate {
        result /= arg.range_ms as f64 / 1000.0;
    }
    Some(result)
}

/// `irate` / `idelta` over the last two samples
fn instant_value(samples: &[Sample], is_rate: bool) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let last = samples[samples.len() - 1];
    let prev = samples[samples.len() - 2];

    let mut result = last.value - prev.value;
    if is_rate && last.value < prev.value {
        // Counter reset
        result = last.value;
    }

    let interval = last.timestamp - prev.timestamp;
    if interval == 0 {
        return None;
    }
    if is_rate {
        result /= interval as f64 / 1000.0;
    }
    Some(result)
}

/// Least-squares fit with x in seconds relative to `intercept_time`
///
/// Returns `(slope, intercept)`.
fn linear_regression(samples: &[Sample], intercept_time: i64) -> (f64, f64) {
    let (mut n, mut sum_x, mut c_x, mut sum_y, mut c_y) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let (mut sum_xy, mut c_xy, mut sum_x2, mut c_x2) = (0.0, 0.0, 0.0, 0.0);
    let init_y = samples[0].value;
    let mut const_y = true;

    for (i, sample) in samples.iter().enumerate() {
        if const_y && i > 0 && sample.value != init_y {
            const_y = false;
        }
        n += 1.0;
        let x = (sample.timestamp - intercept_time) as f64 / 1000.0;
        (sum_x, c_x) = kahan_inc(x, sum_x, c_x);
        (sum_y, c_y) = kahan_inc(sample.value, sum_y, c_y);
        (sum_xy, c_xy) = kahan_inc(x * sample.value, sum_xy, c_xy);
        (sum_x2, c_x2) = kahan_inc(x * x, sum_x2, c_x2);
    }

    if const_y {
        if init_y.is_infinite() {
            return (f64::NAN, f64::NAN);
        }
        return (0.0, init_y);
    }

    let sum_x = sum_x + c_x;
    let sum_y = sum_y + c_y;
    let sum_xy = sum_xy + c_xy;
    let sum_x2 = sum_x2 + c_x2;

    let cov_xy = sum_xy - sum_x * sum_y / n;
    let var_x = sum_x2 - sum_x * sum_x / n;

    let slope = cov_xy / var_x;
    let intercept = sum_y / n - slope * sum_x / n;
    (slope, intercept)
}

/// Interpolated φ-quantile; out-of-range φ maps to ±Inf
fn quantile(q: f64, samples: &[Sample]) -> f64 {
    if q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }

    let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    let rank = q * (n - 1) as f64;
    let lower = rank.floor().max(0.0) as usize;
    let upper = (lower + 1).min(n - 1);
    let weight = rank - rank.floor();
    values[lower] * (1.0 - weight) + values[upper] * weight
}

/// Mean with compensated summation, switching to an incremental mean when
/// the running sum overflows
fn avg_kahan(samples: &[Sample]) -> f64 {
    if samples.len() == 1 {
        return samples[0].value;
    }

    let mut sum = samples[0].value;
    let mut c = 0.0;
    let mut mean = 0.0;
    let mut incremental = false;

    for (i, sample) in samples.iter().enumerate().skip(1) {
        let count = (i + 1) as f64;

        if !incremental {
            let (new_sum, new_c) = kahan_inc(sample.value, sum, c);
            if !new_sum.is_infinite() {
                sum = new_sum;
                c = new_c;
                continue;
            }
            incremental = true;
            mean = sum / (count - 1.0);
            c /= count - 1.0;
        }

        let q = (count - 1.0) / count;
        (mean, c) = kahan_inc(sample.value / count, q * mean, q * c);
    }

    if incremental {
        mean + c
    } else {
        let count = samples.len() as f64;
        sum / count + c / count
    }
}

/// Population variance (Welford with compensated updates)
fn variance_kahan(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }

    let mut count = 0.0;
    let (mut mean, mut c_mean) = (0.0, 0.0);
    let (mut m2, mut c_m2) = (0.0, 0.0);

    for sample in samples {
        count += 1.0;
        let delta = sample.value - (mean + c_mean);
        (mean, c_mean) = kahan_inc(delta / count, mean, c_mean);
        let new_delta = sample.value - (mean + c_mean);
        (m2, c_m2) = kahan_inc(delta * new_delta, m2, c_m2);
    }

    (m2 + c_m2) / count
}

// ============================================================================
// Tests
// ============================================================================
