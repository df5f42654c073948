use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};

/// Outcome of one call to `iterate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A step was accepted and no stop criterion was met.
    Improving,
    /// The gradient norm fell to the `min_gradient` criterion.
    MinimumFound,
    /// Chi-square reached `acceptable_chi_2`.
    Chi2IsOk,
    /// The relative chi-square change fell below `min_chi_2_change`.
    Chi2ChangeTooSmall,
    /// Every parameter sits at a bound with the gradient pointing outward.
    AllParametersAreStuck,
    /// The trust region collapsed relative to the scaled parameters.
    DeltaIsTooSmall,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Improving)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "IMPROVING",
            Self::MinimumFound => "MINIMUM_FOUND",
            Self::Chi2IsOk => "CHI_2_IS_OK",
            Self::Chi2ChangeTooSmall => "CHI_2_CHANGE_TOO_SMALL",
            Self::AllParametersAreStuck => "ALL_PARAMETERS_ARE_STUCK",
            Self::DeltaIsTooSmall => "DELTA_IS_TOO_SMALL",
        }
    }
}

/// Model evaluation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitStats {
    pub nb_f_eval: usize,
    pub nb_df_eval: usize,
}

#[derive(Debug, Clone)]
pub struct FitSummary {
    pub status: Status,
    pub iterations: usize,
    pub chi_2: f64,
    pub norm_gradient: f64,
    pub stats: FitStats,
}

/// One trial step inside `iterate`.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub chi_2: f64,
    pub trial_chi_2: f64,
    pub rho: f64,
    pub alpha: f64,
    pub delta: f64,
    pub norm_gradient: f64,
    pub accepted: bool,
    pub bounded: bool,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self, _status: Status) {}
}

pub struct StdoutReporter {
    rows: Vec<IterationReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self, status: Status) {
        if self.rows.is_empty() {
            emit_line(&format!("status: {}", status.as_str()));
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("iter").set_alignment(CellAlignment::Right),
            Cell::new("chi2").set_alignment(CellAlignment::Right),
            Cell::new("trial").set_alignment(CellAlignment::Right),
            Cell::new("rho").set_alignment(CellAlignment::Right),
            Cell::new("alpha").set_alignment(CellAlignment::Right),
            Cell::new("delta").set_alignment(CellAlignment::Right),
            Cell::new("grad").set_alignment(CellAlignment::Right),
            Cell::new("accepted"),
            Cell::new("bounded"),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.chi_2)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.trial_chi_2)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", row.rho)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.alpha)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.delta)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.norm_gradient)).set_alignment(CellAlignment::Right),
                Cell::new(if row.accepted { "yes" } else { "no" }),
                Cell::new(if row.bounded { "yes" } else { "" }),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        emit_line(&format!("status: {}", status.as_str()));
        self.rows.clear();
    }
}
