use std::fmt::{Display, Formatter};

use itertools::Itertools;
use serde::Deserialize;

use crate::error::{TrainError, TrainResult};
use crate::settings::{Component, ComponentSettings};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EvaluationSettings {
    pub num_classes: usize,
}

impl ComponentSettings for EvaluationSettings {}

/// Confusion matrix of a classifier, rows are actual classes and columns are predictions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    num_classes: usize,
    confusion: Vec<Vec<u64>>,
}

impl Component for Evaluation {
    type Settings = EvaluationSettings;

    fn with_settings(settings: &Self::Settings) -> Self {
        Self::new(settings.num_classes)
    }
}

impl Evaluation {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            confusion: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn record(&mut self, actual: usize, predicted: usize) -> TrainResult<()> {
        if actual >= self.num_classes || predicted >= self.num_classes {
            return Err(TrainError::data(format!(
                "label pair ({}, {}) is outside of {} classes",
                actual, predicted, self.num_classes
            )));
        }
        self.confusion[actual][predicted] += 1;
        Ok(())
    }

    pub fn record_all(
        &mut self,
        actual: impl IntoIterator<Item = usize>,
        predicted: impl IntoIterator<Item = usize>,
    ) -> TrainResult<()> {
        for (actual, predicted) in actual.into_iter().zip(predicted) {
            self.record(actual, predicted)?;
        }
        Ok(())
    }

    pub fn count(&self, actual: usize, predicted: usize) -> u64 {
        self.confusion[actual][predicted]
    }

    pub fn total(&self) -> u64 {
        self.confusion.iter().flatten().sum()
    }

    fn correct(&self) -> u64 {
        (0..self.num_classes).map(|c| self.confusion[c][c]).sum()
    }

    fn actual_count(&self, class: usize) -> u64 {
        self.confusion[class].iter().sum()
    }

    fn predicted_count(&self, class: usize) -> u64 {
        self.confusion.iter().map(|row| row[class]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.correct() as f64 / total as f64,
        }
    }

    /// `None` when the class was never predicted.
    pub fn precision(&self, class: usize) -> Option<f64> {
        match self.predicted_count(class) {
            0 => None,
            predicted => Some(self.confusion[class][class] as f64 / predicted as f64),
        }
    }

    /// `None` when the class never occurred.
    pub fn recall(&self, class: usize) -> Option<f64> {
        match self.actual_count(class) {
            0 => None,
            actual => Some(self.confusion[class][class] as f64 / actual as f64),
        }
    }

    pub fn f1(&self, class: usize) -> Option<f64> {
        let precision = self.precision(class)?;
        let recall = self.recall(class)?;
        if precision + recall == 0.0 {
            return Some(0.0);
        }
        Some(2.0 * precision * recall / (precision + recall))
    }

    pub fn macro_precision(&self) -> f64 {
        Self::mean((0..self.num_classes).filter_map(|c| self.precision(c)))
    }

    pub fn macro_recall(&self) -> f64 {
        Self::mean((0..self.num_classes).filter_map(|c| self.recall(c)))
    }

    pub fn macro_f1(&self) -> f64 {
        Self::mean((0..self.num_classes).filter_map(|c| self.f1(c)))
    }

    fn mean(values: impl Iterator<Item = f64>) -> f64 {
        let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        match count {
            0 => 0.0,
            count => sum / count as f64,
        }
    }

    pub fn never_predicted(&self) -> Vec<usize> {
        (0..self.num_classes)
            .filter(|c| self.predicted_count(*c) == 0)
            .collect()
    }

    pub fn stats(&self) -> String {
        let mut out = String::new();
        out.push_str("\n========================Evaluation Metrics========================\n");
        out.push_str(&format!(" # of classes:    {}\n", self.num_classes));
        out.push_str(&format!(" # of samples:    {}\n", self.total()));
        out.push_str(&format!(" Accuracy:        {:.4}\n", self.accuracy()));
        out.push_str(&format!(" Precision:       {:.4}\n", self.macro_precision()));
        out.push_str(&format!(" Recall:          {:.4}\n", self.macro_recall()));
        out.push_str(&format!(" F1 Score:        {:.4}\n", self.macro_f1()));
        out.push_str(&format!(
            "Precision, recall & F1: macro-averaged (equally weighted avg. of {} classes)\n",
            self.num_classes
        ));

        let missing = self.never_predicted();
        if !missing.is_empty() {
            out.push_str(&format!(
                "Warning: {} classes were never predicted and are excluded from precision: [{}]\n",
                missing.len(),
                missing.iter().join(", ")
            ));
        }

        out.push_str("\n=========================Confusion Matrix=========================\n");
        let width = self.total().to_string().len().max(3) + 1;
        let header = (0..self.num_classes)
            .map(|c| format!("{:>w$}", c, w = width))
            .join("");
        out.push_str(&format!("{}\n", header));
        out.push_str(&format!("{}\n", "-".repeat(width * self.num_classes)));
        for (actual, row) in self.confusion.iter().enumerate() {
            let counts = row.iter().map(|v| format!("{:>w$}", v, w = width)).join("");
            out.push_str(&format!("{} | {}\n", counts, actual));
        }
        out.push_str("\nConfusion matrix format: Actual (rowClass) predicted as (columnClass) N times\n");
        out.push_str("==================================================================");
        out
    }
}

impl Display for Evaluation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stats())
    }
}
