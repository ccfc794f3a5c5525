use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfError {
    #[error("Variable = {variable}, number of variables = {num_variables} ({context})")]
    VariableIndexOutOfRange {
        variable: usize,
        num_variables: usize,
        context: &'static str,
    },
    #[error("Variable {0} does not exist in the solution")]
    VariableNotInSolution(usize),
    #[error("Input variable {0} has been merged")]
    MergedInputVariable(usize),
    #[error("Output variable {0} has been merged")]
    MergedOutputVariable(usize),
    #[error("Invalid equation type tag: {0}")]
    InvalidEquationType(i64),
    #[error("Unsupported non-linear constraint: {0}")]
    UnsupportedConstraintKind(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Bounds of variable {variable} are infeasible: [{lower}, {upper}]")]
    InfeasibleBounds {
        variable: usize,
        lower: f64,
        upper: f64,
    },
    #[error("Input assignment has {actual} entries, input layer has {expected}")]
    InvalidInputDimension { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VfResult<T> = Result<T, VfError>;
