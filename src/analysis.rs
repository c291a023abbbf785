//! Canned pandas analyses.
//!
//! A request is turned into an ordinary snippet and executed through the
//! supervisor like any other code, so the same capability policy applies.
//! Caller data and column names are embedded as escaped string literals,
//! never spliced into the source.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotKind {
    Histogram,
    Scatter,
    Line,
    Bar,
    Box,
    Heatmap,
}

impl FromStr for PlotKind {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "histogram" | "hist" => Ok(PlotKind::Histogram),
            "scatter" => Ok(PlotKind::Scatter),
            "line" => Ok(PlotKind::Line),
            "bar" => Ok(PlotKind::Bar),
            "box" => Ok(PlotKind::Box),
            "heatmap" => Ok(PlotKind::Heatmap),
            other => Err(AnalysisError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for PlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlotKind::Histogram => "histogram",
            PlotKind::Scatter => "scatter",
            PlotKind::Line => "line",
            PlotKind::Bar => "bar",
            PlotKind::Box => "box",
            PlotKind::Heatmap => "heatmap",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisKind {
    Describe,
    Correlation,
    Plot(PlotKind),
    /// Caller code run after the data is loaded into `df`.
    Custom(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("no data supplied")]
    EmptyData,
    #[error("unknown analysis or plot kind '{0}'")]
    UnknownKind(String),
    #[error("{plot} plot needs at least {needed} column(s)")]
    MissingColumns { plot: PlotKind, needed: usize },
    #[error("custom analysis needs code")]
    EmptyCustomCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub data: String,
    pub kind: AnalysisKind,
    pub columns: Vec<String>,
}

impl AnalysisRequest {
    pub fn new(data: impl Into<String>, kind: AnalysisKind) -> Self {
        Self {
            data: data.into(),
            kind,
            columns: Vec::new(),
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Split a comma-separated column list, dropping blanks.
    pub fn parse_columns(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn format(&self) -> DataFormat {
        let trimmed = self.data.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            DataFormat::Json
        } else {
            DataFormat::Csv
        }
    }

    pub fn build_snippet(&self) -> Result<String, AnalysisError> {
        if self.data.trim().is_empty() {
            return Err(AnalysisError::EmptyData);
        }

        let mut lines: Vec<String> = vec!["import pandas as pd".into(), "import numpy as np".into()];
        if matches!(self.kind, AnalysisKind::Plot(_) | AnalysisKind::Correlation) {
            lines.push("import matplotlib.pyplot as plt".into());
        }
        if matches!(
            self.kind,
            AnalysisKind::Correlation | AnalysisKind::Plot(PlotKind::Heatmap)
        ) {
            lines.push("import seaborn as sns".into());
        }

        match self.format() {
            DataFormat::Json => {
                lines.push("import json".into());
                lines.push(format!("data = json.loads({})", py_str(&self.data)));
                lines.push("df = pd.DataFrame(data)".into());
            }
            DataFormat::Csv => {
                lines.push("from io import StringIO".into());
                lines.push(format!("csv_data = {}", py_str(&self.data)));
                lines.push("df = pd.read_csv(StringIO(csv_data))".into());
            }
        }

        match &self.kind {
            AnalysisKind::Describe => lines.extend(
                [
                    "print('Data Shape:', df.shape)",
                    "print('\\nData Types:')",
                    "print(df.dtypes)",
                    "print('\\nBasic Statistics:')",
                    "print(df.describe())",
                    "print('\\nMissing Values:')",
                    "print(df.isnull().sum())",
                ]
                .map(String::from),
            ),
            AnalysisKind::Correlation => {
                lines.push("numeric_df = df.select_dtypes(include=[np.number])".into());
                lines.push("if not numeric_df.empty:".into());
                lines.push("    print('Correlation Matrix:')".into());
                lines.push("    print(numeric_df.corr())".into());
                lines.push("    plt.figure(figsize=(10, 8))".into());
                lines.push(
                    "    sns.heatmap(numeric_df.corr(), annot=True, cmap='coolwarm', center=0)".into(),
                );
                lines.push("    plt.title('Correlation Heatmap')".into());
                lines.push("else:".into());
                lines.push("    print('No numeric columns found for correlation analysis')".into());
            }
            AnalysisKind::Plot(plot) => self.plot_lines(*plot, &mut lines)?,
            AnalysisKind::Custom(code) => {
                if code.trim().is_empty() {
                    return Err(AnalysisError::EmptyCustomCode);
                }
                lines.push(code.clone());
            }
        }

        Ok(lines.join("\n"))
    }

    fn plot_lines(&self, plot: PlotKind, lines: &mut Vec<String>) -> Result<(), AnalysisError> {
        let cols = py_list(&self.columns);
        let select_numeric = |lines: &mut Vec<String>| {
            lines.push("numeric_df = df.select_dtypes(include=[np.number])".into());
            if !self.columns.is_empty() {
                lines.push(format!(
                    "numeric_df = numeric_df[[c for c in {} if c in numeric_df.columns]]",
                    cols
                ));
            }
        };

        match plot {
            PlotKind::Histogram => {
                select_numeric(lines);
                lines.extend(
                    [
                        "if not numeric_df.empty:",
                        "    n_cols = len(numeric_df.columns)",
                        "    n_rows = (n_cols + 1) // 2",
                        "    fig, axes = plt.subplots(n_rows, 2, figsize=(12, 4 * n_rows))",
                        "    axes = axes.flatten()",
                        "    for i, col in enumerate(numeric_df.columns):",
                        "        numeric_df[col].hist(ax=axes[i], bins=20)",
                        "        axes[i].set_title(f'Distribution of {col}')",
                        "    for j in range(n_cols, len(axes)):",
                        "        axes[j].set_visible(False)",
                        "    plt.tight_layout()",
                        "else:",
                        "    print('No numeric columns to plot')",
                    ]
                    .map(String::from),
                );
            }
            PlotKind::Scatter => {
                let [x, y] = match self.columns.as_slice() {
                    [x, y, ..] => [py_str(x), py_str(y)],
                    _ => return Err(AnalysisError::MissingColumns { plot, needed: 2 }),
                };
                lines.push("plt.figure(figsize=(10, 6))".into());
                lines.push(format!("plt.scatter(df[{x}], df[{y}])"));
                lines.push(format!("plt.xlabel({x})"));
                lines.push(format!("plt.ylabel({y})"));
                lines.push(format!("plt.title('Scatter: ' + {x} + ' vs ' + {y})"));
            }
            PlotKind::Line => {
                select_numeric(lines);
                lines.push("numeric_df.plot(kind='line', figsize=(10, 6))".into());
                lines.push("plt.title('Line Plot')".into());
            }
            PlotKind::Bar => {
                let column = match self.columns.first() {
                    Some(c) => py_str(c),
                    None => return Err(AnalysisError::MissingColumns { plot, needed: 1 }),
                };
                lines.push(format!(
                    "df[{column}].value_counts().plot(kind='bar', figsize=(10, 6))"
                ));
                lines.push(format!("plt.title('Bar chart of ' + {column})"));
                lines.push("plt.xticks(rotation=45)".into());
            }
            PlotKind::Box => {
                select_numeric(lines);
                lines.push("numeric_df.plot(kind='box', figsize=(10, 6))".into());
                lines.push("plt.title('Box Plot')".into());
                lines.push("plt.xticks(rotation=45)".into());
            }
            PlotKind::Heatmap => {
                select_numeric(lines);
                lines.push("plt.figure(figsize=(10, 8))".into());
                lines.push(
                    "sns.heatmap(numeric_df.corr(), annot=True, cmap='coolwarm', center=0)".into(),
                );
                lines.push("plt.title('Correlation Heatmap')".into());
            }
        }
        Ok(())
    }
}

// A JSON string literal is also a valid Python string literal.
fn py_str(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "''".to_string())
}

fn py_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

impl FromStr for AnalysisKind {
    type Err = AnalysisError;

    /// Parses the code-free kinds; `custom` needs its code attached separately.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "describe" => Ok(AnalysisKind::Describe),
            "correlation" | "corr" => Ok(AnalysisKind::Correlation),
            "plot" => Ok(AnalysisKind::Plot(PlotKind::Histogram)),
            other => Err(AnalysisError::UnknownKind(other.to_string())),
        }
    }
}
