use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use log::debug;
use ndarray::prelude::*;
use thiserror::Error;

pub mod operations;
pub mod reference;
pub mod serialization;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("no blob named {0:?} in workspace")]
    MissingBlob(String),
    #[error("blob {name:?} holds {actual} data, expected {expected}")]
    BlobKind {
        name: String,
        expected: BlobKind,
        actual: BlobKind,
    },
    #[error("no operator registered under type {0:?}")]
    UnknownOperator(String),
    #[error("{operator} expects {expected} {direction}, got {actual}")]
    Arity {
        operator: String,
        direction: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("shape mismatch in {operator}: {message}")]
    ShapeMismatch { operator: String, message: String },
    #[error("invalid session lengths for {operator}: {message}")]
    SessionLengths { operator: String, message: String },
    #[error("attribute {name:?} of {operator} should be {expected}")]
    AttributeKind {
        operator: String,
        name: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WriteArchive(#[from] ndarray_npy::WriteNpzError),
    #[error(transparent)]
    ReadArchive(#[from] ndarray_npy::ReadNpzError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    Float,
    Integer,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::Float => write!(f, "float"),
            BlobKind::Integer => write!(f, "integer"),
        }
    }
}

/// A named array living in a [`Workspace`].
#[derive(Clone, Debug, PartialEq)]
pub enum Blob {
    Float(ArrayD<f32>),
    Integer(ArrayD<i32>),
}

impl Blob {
    pub fn kind(&self) -> BlobKind {
        match self {
            Blob::Float(_) => BlobKind::Float,
            Blob::Integer(_) => BlobKind::Integer,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Blob::Float(array) => array.shape(),
            Blob::Integer(array) => array.shape(),
        }
    }

    pub fn as_float(&self, name: &str) -> Result<&ArrayD<f32>, WorkspaceError> {
        match self {
            Blob::Float(array) => Ok(array),
            Blob::Integer(_) => Err(WorkspaceError::BlobKind {
                name: name.to_owned(),
                expected: BlobKind::Float,
                actual: BlobKind::Integer,
            }),
        }
    }

    pub fn as_integer(&self, name: &str) -> Result<&ArrayD<i32>, WorkspaceError> {
        match self {
            Blob::Integer(array) => Ok(array),
            Blob::Float(_) => Err(WorkspaceError::BlobKind {
                name: name.to_owned(),
                expected: BlobKind::Integer,
                actual: BlobKind::Float,
            }),
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Blob {
    fn from(array: Array<f32, D>) -> Self {
        Blob::Float(array.into_dyn())
    }
}

impl<D: Dimension> From<Array<i32, D>> for Blob {
    fn from(array: Array<i32, D>) -> Self {
        Blob::Integer(array.into_dyn())
    }
}

/// Scratch store of named blobs that operators read their inputs from and
/// write their outputs to.
#[derive(Debug, Default)]
pub struct Workspace {
    blobs: HashMap<String, Blob>,
}

#[allow(dead_code)]
impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, blob: impl Into<Blob>) {
        self.blobs.insert(name.to_owned(), blob.into());
    }

    pub fn get(&self, name: &str) -> Result<&Blob, WorkspaceError> {
        self.blobs
            .get(name)
            .ok_or_else(|| WorkspaceError::MissingBlob(name.to_owned()))
    }

    pub fn float(&self, name: &str) -> Result<&ArrayD<f32>, WorkspaceError> {
        self.get(name)?.as_float(name)
    }

    pub fn integer(&self, name: &str) -> Result<&ArrayD<i32>, WorkspaceError> {
        self.get(name)?.as_integer(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Blob> {
        self.blobs.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.blobs.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn reset(&mut self) {
        self.blobs.clear();
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    Bool(bool),
    Integer(i64),
    Float(f32),
    Text(String),
}

impl From<bool> for Attribute {
    fn from(value: bool) -> Self {
        Attribute::Bool(value)
    }
}

impl From<i64> for Attribute {
    fn from(value: i64) -> Self {
        Attribute::Integer(value)
    }
}

impl From<f32> for Attribute {
    fn from(value: f32) -> Self {
        Attribute::Float(value)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Attribute::Text(value.to_owned())
    }
}

/// What `create_operator` hands back: an operator type plus the blob names
/// it reads and writes. Nothing is checked until it runs.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorDefinition {
    type_name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    attributes: HashMap<String, Attribute>,
}

#[allow(dead_code)]
impl OperatorDefinition {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn bool_attribute(&self, name: &str, default: bool) -> Result<bool, WorkspaceError> {
        match self.attributes.get(name) {
            None => Ok(default),
            Some(Attribute::Bool(value)) => Ok(*value),
            // integer flags are accepted as truthiness
            Some(Attribute::Integer(value)) => Ok(*value != 0),
            Some(_) => Err(WorkspaceError::AttributeKind {
                operator: self.type_name.clone(),
                name: name.to_owned(),
                expected: "a bool",
            }),
        }
    }
}

pub fn create_operator(
    type_name: &str,
    inputs: &[&str],
    outputs: &[&str],
    attributes: Vec<(&str, Attribute)>,
) -> OperatorDefinition {
    OperatorDefinition {
        type_name: type_name.to_owned(),
        inputs: inputs.iter().map(|&name| name.to_owned()).collect(),
        outputs: outputs.iter().map(|&name| name.to_owned()).collect(),
        attributes: attributes
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect(),
    }
}

/// Runs the operator's kernel once. Outputs are only written if the kernel
/// succeeds, so a failed run leaves the workspace as it was.
pub fn run_operator_once(
    workspace: &mut Workspace,
    definition: &OperatorDefinition,
) -> Result<(), WorkspaceError> {
    let operation = operations::instantiate(definition)?;
    if definition.inputs.len() != operation.input_count() {
        return Err(WorkspaceError::Arity {
            operator: definition.type_name.clone(),
            direction: "inputs",
            expected: operation.input_count(),
            actual: definition.inputs.len(),
        });
    }
    if definition.outputs.len() != operation.output_count() {
        return Err(WorkspaceError::Arity {
            operator: definition.type_name.clone(),
            direction: "outputs",
            expected: operation.output_count(),
            actual: definition.outputs.len(),
        });
    }

    debug!(
        "running {} on {:?} -> {:?}",
        definition.type_name, definition.inputs, definition.outputs
    );
    let outputs = {
        let inputs = definition
            .inputs
            .iter()
            .map(|name| workspace.get(name))
            .collect::<Result<Vec<_>, _>>()?;
        operation.forward(&inputs)?
    };
    for (name, blob) in definition.outputs.iter().zip(outputs) {
        workspace.set(name, blob);
    }
    Ok(())
}

/// Item ranges of consecutive sessions in a flattened, session-major batch.
pub fn session_ranges(session_lengths: &[usize]) -> Vec<Range<usize>> {
    let mut start = 0;
    session_lengths
        .iter()
        .map(|&length| {
            let range = start..start + length;
            start += length;
            range
        })
        .collect()
}
