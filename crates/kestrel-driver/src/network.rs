//! Registered networks
//!
//! A network is a compiled model that has already been placed in device
//! memory by the loader: what remains visible to this layer is its declared
//! buffer table — which input and output buffers an inference must supply,
//! and the device address of the prepared table the firmware walks.
//! Compilation and DMA placement belong to other subsystems; addresses
//! arrive here as opaque `u64` values.

use crate::error::{KestrelError, Result};

/// One declared slot in a network's buffer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Binding id within the table.
    pub id: u32,
    /// Required size in bytes.
    pub size: u32,
}

/// A concrete buffer supplied for one inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    /// Device address of the buffer.
    pub address: u64,
    /// Size in bytes.
    pub size: u32,
}

/// Everything needed to register a network.
#[derive(Debug, Clone)]
pub struct NetworkDescriptor {
    /// Declared input slots, in binding order.
    pub inputs: Vec<BufferSpec>,
    /// Declared output slots, in binding order.
    pub outputs: Vec<BufferSpec>,
    /// Device address of the prepared buffer table.
    pub buffer_table: u64,
}

/// A registered network. Inferences hold a strong reference to their
/// network, so the table cannot be torn down while work is in flight.
#[derive(Debug)]
pub struct Network {
    id: u64,
    inputs: Vec<BufferSpec>,
    outputs: Vec<BufferSpec>,
    buffer_table: u64,
}

impl Network {
    pub(crate) fn new(id: u64, descriptor: NetworkDescriptor) -> Result<Self> {
        let mut ids: Vec<u32> = descriptor
            .inputs
            .iter()
            .chain(descriptor.outputs.iter())
            .map(|spec| spec.id)
            .collect();
        ids.sort_unstable();
        if ids.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(KestrelError::validation("duplicate buffer binding id"));
        }

        Ok(Self {
            id,
            inputs: descriptor.inputs,
            outputs: descriptor.outputs,
            buffer_table: descriptor.buffer_table,
        })
    }

    /// Network id, unique within its device.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Declared input slots.
    #[must_use]
    pub fn inputs(&self) -> &[BufferSpec] {
        &self.inputs
    }

    /// Declared output slots.
    #[must_use]
    pub fn outputs(&self) -> &[BufferSpec] {
        &self.outputs
    }

    /// Device address of the prepared buffer table.
    #[must_use]
    pub const fn buffer_table(&self) -> u64 {
        self.buffer_table
    }

    /// Check a schedule request against the declared table. Count or size
    /// mismatches fail synchronously; nothing is ever queued for an invalid
    /// request.
    pub(crate) fn validate_request(
        &self,
        inputs: &[BufferHandle],
        outputs: &[BufferHandle],
    ) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(KestrelError::validation(format!(
                "input count mismatch: got {}, network declares {}",
                inputs.len(),
                self.inputs.len()
            )));
        }
        if outputs.len() != self.outputs.len() {
            return Err(KestrelError::validation(format!(
                "output count mismatch: got {}, network declares {}",
                outputs.len(),
                self.outputs.len()
            )));
        }

        for (handle, spec) in inputs.iter().zip(self.inputs.iter()) {
            if handle.size < spec.size {
                return Err(KestrelError::validation(format!(
                    "input buffer {} too small: {} < {}",
                    spec.id, handle.size, spec.size
                )));
            }
        }
        for (handle, spec) in outputs.iter().zip(self.outputs.iter()) {
            if handle.size < spec.size {
                return Err(KestrelError::validation(format!(
                    "output buffer {} too small: {} < {}",
                    spec.id, handle.size, spec.size
                )));
            }
        }

        Ok(())
    }
}
