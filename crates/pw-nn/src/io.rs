//! Snapshot persistence for module parameters and buffers.
//!
//! Snapshots are plain name-to-tensor maps covering both trainable parameters
//! and non-trainable buffers (normalisation running statistics), stored either
//! as readable JSON or compact bincode. Loading is strict: every parameter and
//! buffer of the target module must be present in the snapshot.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: HashMap<String, StoredTensor>,
    #[serde(default)]
    buffers: HashMap<String, StoredTensor>,
}

fn store_map(state: &HashMap<String, Tensor>) -> HashMap<String, StoredTensor> {
    state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect()
}

fn tensor_map(stored: HashMap<String, StoredTensor>) -> PureResult<HashMap<String, Tensor>> {
    let mut state = HashMap::new();
    for (name, tensor) in stored {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

impl ModuleSnapshot {
    fn capture<M: Module + ?Sized>(module: &M) -> PureResult<Self> {
        Ok(Self {
            parameters: store_map(&module.state_dict()?),
            buffers: store_map(&module.buffer_dict()?),
        })
    }

    fn from_state(state: &HashMap<String, Tensor>) -> Self {
        Self {
            parameters: store_map(state),
            buffers: HashMap::new(),
        }
    }

    fn restore<M: Module + ?Sized>(self, module: &mut M) -> PureResult<()> {
        module.load_state_dict(&tensor_map(self.parameters)?)?;
        module.load_buffer_dict(&tensor_map(self.buffers)?)
    }

    fn into_state(self) -> PureResult<HashMap<String, Tensor>> {
        tensor_map(self.parameters)
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = ModuleSnapshot::capture(module)?;
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)?;
    Ok(())
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    snapshot.restore(module)
}

pub fn save_state_dict_json<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let snapshot = ModuleSnapshot::from_state(state);
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)?;
    Ok(())
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    snapshot.into_state()
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = ModuleSnapshot::capture(module)?;
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &snapshot).map_err(serde_error)?;
    Ok(())
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = bincode::deserialize_from(reader).map_err(serde_error)?;
    snapshot.restore(module)
}
