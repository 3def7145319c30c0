//! Tensor descriptors and where their data lives.
//!
//! A [`Tensor`] carries up to four extents (`ne`) and byte strides (`nb`)
//! in GGML order: `ne[0]` is the row length, `ne[1]` the number of rows,
//! `ne[2]` and `ne[3]` the outer batch dimensions. Its data is either absent,
//! a host byte buffer, or a set of per-device buffers (one device, or a row
//! split across several). The [`Location`] is derived from the storage, so a
//! tensor with no data always reports [`Location::Unassigned`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::config::Precision;
use crate::device::{CompletionSignal, DevicePtr};
use crate::error::OffloadError;
use crate::pool::TensorId;
use crate::quant::{self, convert_row, GgmlType};

/// Maximum tensor rank.
pub const MAX_DIMS: usize = 4;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Where a tensor's data currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Unassigned,
    Host,
    /// Whole tensor on the main device.
    Device,
    /// Rows partitioned across devices.
    Split,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unassigned => "unassigned",
            Self::Host => "host",
            Self::Device => "device",
            Self::Split => "split",
        };
        f.write_str(s)
    }
}

/// A cached copy of a tensor's device data converted to a dense precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryBuffer {
    pub ptr: DevicePtr,
    pub size: usize,
    pub precision: Precision,
}

/// The part of a tensor held by one device.
#[derive(Debug)]
pub struct DeviceSlice {
    pub ptr: DevicePtr,
    /// Allocated bytes, including padding on the last split device.
    pub size: usize,
    /// Rows `[row_low, row_high)` of the full tensor held by this slice.
    pub row_low: usize,
    pub row_high: usize,
    /// False for views and scratch-arena placements.
    pub(crate) owned: bool,
    pub(crate) signal: Option<CompletionSignal>,
}

impl DeviceSlice {
    pub fn rows(&self) -> usize {
        self.row_high - self.row_low
    }
}

/// Device-resident storage: one optional slice per device.
#[derive(Debug, Default)]
pub struct DeviceData {
    pub(crate) split: bool,
    pub(crate) slices: Vec<Option<DeviceSlice>>,
    secondary: Mutex<Vec<Option<SecondaryBuffer>>>,
}

impl DeviceData {
    pub(crate) fn new(split: bool, slices: Vec<Option<DeviceSlice>>) -> Self {
        let n = slices.len();
        Self {
            split,
            slices,
            secondary: Mutex::new(vec![None; n]),
        }
    }

    pub fn is_split(&self) -> bool {
        self.split
    }

    pub fn slice(&self, device: usize) -> Option<&DeviceSlice> {
        self.slices.get(device).and_then(|s| s.as_ref())
    }

    /// Devices holding at least one row.
    pub fn devices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slices
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
    }

    fn secondaries(&self) -> MutexGuard<'_, Vec<Option<SecondaryBuffer>>> {
        self.secondary.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn secondary(&self, device: usize) -> Option<SecondaryBuffer> {
        self.secondaries().get(device).copied().flatten()
    }

    pub(crate) fn set_secondary(&self, device: usize, buf: SecondaryBuffer) {
        let mut guard = self.secondaries();
        if let Some(slot) = guard.get_mut(device) {
            *slot = Some(buf);
        }
    }

    pub(crate) fn take_secondary(&self, device: usize) -> Option<SecondaryBuffer> {
        self.secondaries().get_mut(device).and_then(|s| s.take())
    }

    pub(crate) fn take_all_secondaries(&self) -> Vec<SecondaryBuffer> {
        self.secondaries().iter_mut().filter_map(|s| s.take()).collect()
    }
}

/// Backing data of a tensor.
#[derive(Debug, Default)]
pub enum Storage {
    #[default]
    Unassigned,
    Host(Vec<u8>),
    Device(DeviceData),
}

/// A tensor descriptor with its data.
#[derive(Debug)]
pub struct Tensor {
    id: TensorId,
    name: String,
    ty: GgmlType,
    ne: [usize; MAX_DIMS],
    nb: [usize; MAX_DIMS],
    pub(crate) storage: Storage,
}

fn extents(shape: &[usize]) -> Result<[usize; MAX_DIMS], OffloadError> {
    if shape.is_empty() || shape.len() > MAX_DIMS {
        return Err(OffloadError::ShapeMismatch {
            expected: vec![MAX_DIMS],
            actual: shape.to_vec(),
        });
    }
    let mut ne = [1usize; MAX_DIMS];
    ne[..shape.len()].copy_from_slice(shape);
    Ok(ne)
}

/// Strides of a contiguous tensor.
pub fn contiguous_strides(ty: GgmlType, ne: &[usize; MAX_DIMS]) -> [usize; MAX_DIMS] {
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = ty.type_size();
    nb[1] = nb[0] * (ne[0] / ty.block_size());
    nb[2] = nb[1] * ne[1];
    nb[3] = nb[2] * ne[2];
    nb
}

impl Tensor {
    /// Describe a contiguous tensor without data.
    ///
    /// The row length `shape[0]` must be a multiple of the type's block size.
    pub fn new(name: impl Into<String>, ty: GgmlType, shape: &[usize]) -> Result<Self, OffloadError> {
        let ne = extents(shape)?;
        if ne[0] % ty.block_size() != 0 {
            return Err(OffloadError::RowNotBlockAligned {
                ty,
                row_len: ne[0],
                block: ty.block_size(),
            });
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ty,
            ne,
            nb: contiguous_strides(ty, &ne),
            storage: Storage::Unassigned,
        })
    }

    /// Host tensor from raw bytes in the layout of `ty`.
    pub fn from_bytes(
        name: impl Into<String>,
        ty: GgmlType,
        shape: &[usize],
        data: Vec<u8>,
    ) -> Result<Self, OffloadError> {
        let mut t = Self::new(name, ty, shape)?;
        let expected = t.byte_size();
        if data.len() != expected {
            return Err(OffloadError::DataLength {
                expected,
                actual: data.len(),
            });
        }
        t.storage = Storage::Host(data);
        Ok(t)
    }

    /// Host tensor of `ty` encoded from f32 values.
    pub fn from_f32(
        name: impl Into<String>,
        ty: GgmlType,
        shape: &[usize],
        values: &[f32],
    ) -> Result<Self, OffloadError> {
        let data = quant::quantize(ty, values)?;
        let t = Self::from_bytes(name, ty, shape, data)?;
        debug!(name = %t.name, ty = %ty, ne = ?t.ne, "created host tensor");
        Ok(t)
    }

    /// Zero-filled F32 host tensor.
    pub fn zeros(name: impl Into<String>, shape: &[usize]) -> Result<Self, OffloadError> {
        let mut t = Self::new(name, GgmlType::F32, shape)?;
        t.storage = Storage::Host(vec![0u8; t.byte_size()]);
        Ok(t)
    }

    /// A view of device-resident data with its own extents, strides and byte
    /// offset. The view does not own the memory.
    pub fn view(
        &self,
        name: impl Into<String>,
        shape: &[usize],
        nb: [usize; MAX_DIMS],
        offset: usize,
    ) -> Result<Self, OffloadError> {
        let data = match &self.storage {
            Storage::Device(d) if !d.split => d,
            _ => {
                return Err(OffloadError::Config(format!(
                    "tensor '{}' is {}; views need single-device data",
                    self.name,
                    self.location()
                )))
            }
        };
        let mut t = Self::new(name, self.ty, shape)?;
        t.nb = nb;
        let slices = data
            .slices
            .iter()
            .map(|s| {
                s.as_ref().map(|s| DeviceSlice {
                    ptr: s.ptr.add(offset),
                    size: s.size.saturating_sub(offset),
                    row_low: 0,
                    row_high: t.nrows(),
                    owned: false,
                    signal: None,
                })
            })
            .collect();
        t.storage = Storage::Device(DeviceData::new(false, slices));
        Ok(t)
    }

    /// View with axes reordered: axis `i` of the result is axis `axes[i]`
    /// of `self`.
    pub fn permuted(&self, name: impl Into<String>, axes: [usize; MAX_DIMS]) -> Result<Self, OffloadError> {
        let mut seen = [false; MAX_DIMS];
        for &a in &axes {
            if a >= MAX_DIMS || seen[a] {
                return Err(OffloadError::Config(format!("invalid permutation {:?}", axes)));
            }
            seen[a] = true;
        }
        let ne: Vec<usize> = axes.iter().map(|&a| self.ne[a]).collect();
        let nb = [self.nb[axes[0]], self.nb[axes[1]], self.nb[axes[2]], self.nb[axes[3]]];
        self.view(name, &ne, nb, 0)
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> GgmlType {
        self.ty
    }

    pub fn ne(&self) -> [usize; MAX_DIMS] {
        self.ne
    }

    pub fn nb(&self) -> [usize; MAX_DIMS] {
        self.nb
    }

    pub fn n_elements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Rows across all outer dimensions.
    pub fn nrows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    /// Bytes of one packed row.
    pub fn row_size(&self) -> usize {
        self.ty.row_size(self.ne[0])
    }

    /// Bytes of the whole tensor when contiguous.
    pub fn byte_size(&self) -> usize {
        self.nrows() * self.row_size()
    }

    pub fn is_contiguous(&self) -> bool {
        self.nb == contiguous_strides(self.ty, &self.ne)
    }

    /// Elements of a row are adjacent and rows follow each other.
    pub fn rows_contiguous(&self) -> bool {
        self.nb[0] == self.ty.type_size() && self.nb[1] == self.row_size()
    }

    pub fn location(&self) -> Location {
        match &self.storage {
            Storage::Unassigned => Location::Unassigned,
            Storage::Host(_) => Location::Host,
            Storage::Device(d) if d.split => Location::Split,
            Storage::Device(_) => Location::Device,
        }
    }

    pub fn is_on_device(&self) -> bool {
        matches!(self.storage, Storage::Device(_))
    }

    pub fn host_data(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Host(v) => Some(v),
            _ => None,
        }
    }

    pub fn host_data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.storage {
            Storage::Host(v) => Some(v),
            _ => None,
        }
    }

    pub fn device_data(&self) -> Option<&DeviceData> {
        match &self.storage {
            Storage::Device(d) => Some(d),
            _ => None,
        }
    }

    /// Decode host data to f32.
    pub fn to_f32(&self) -> Result<Vec<f32>, OffloadError> {
        let data = self.host_data().ok_or_else(|| {
            OffloadError::Config(format!(
                "tensor '{}' is {}, not host-resident",
                self.name,
                self.location()
            ))
        })?;
        let mut out = vec![0.0f32; self.n_elements()];
        convert_row::<f32>(self.ty, data, &mut out)?;
        Ok(out)
    }

    /// Attach host data, replacing any previous storage.
    pub fn set_host_data(&mut self, data: Vec<u8>) -> Result<(), OffloadError> {
        if data.len() != self.byte_size() {
            return Err(OffloadError::DataLength {
                expected: self.byte_size(),
                actual: data.len(),
            });
        }
        self.storage = Storage::Host(data);
        Ok(())
    }
}
