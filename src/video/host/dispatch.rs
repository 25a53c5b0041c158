//! Host-side compute kernels.
//!
//! A [`HostKernel`] is the CPU implementation of a compute shader. The host
//! device runs it once per dispatch with a [`HostDispatch`] holding copies of
//! the bound ranges; writable bindings are stored back when it returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytemuck::Pod;

use crate::accel::SceneView;
use crate::util::{Error, Result};
use crate::video::BindingKind;

/// CPU implementation of a compute shader.
pub trait HostKernel: Send + Sync {
    fn dispatch(&self, ctx: &mut HostDispatch<'_>) -> Result<()>;
}

pub(crate) enum BoundResource {
    Buffer { kind: BindingKind, data: Vec<u8>, dirty: bool },
    Scene(Arc<SceneView>),
}

/// Everything one dispatch can see.
pub struct HostDispatch<'a> {
    pipeline: &'a str,
    groups: [u32; 3],
    workgroup_size: [u32; 3],
    push_constants: &'a [u8],
    pub(crate) bindings: BTreeMap<u32, BoundResource>,
}

impl<'a> HostDispatch<'a> {
    pub(crate) fn new(
        pipeline: &'a str,
        groups: [u32; 3],
        workgroup_size: [u32; 3],
        push_constants: &'a [u8],
        bindings: BTreeMap<u32, BoundResource>,
    ) -> Self {
        Self { pipeline, groups, workgroup_size, push_constants, bindings }
    }

    pub fn groups(&self) -> [u32; 3] {
        self.groups
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Total invocations per axis.
    pub fn invocations(&self) -> [u32; 3] {
        [
            self.groups[0] * self.workgroup_size[0],
            self.groups[1] * self.workgroup_size[1],
            self.groups[2] * self.workgroup_size[2],
        ]
    }

    fn missing(&self, binding: u32, what: &str) -> Error {
        Error::Shader { name: self.pipeline.to_string(), reason: format!("binding {binding}: {what}") }
    }

    pub fn push_constants<T: Pod>(&self) -> Result<T> {
        let size = std::mem::size_of::<T>();
        if self.push_constants.len() < size {
            return Err(Error::Shader {
                name: self.pipeline.to_string(),
                reason: format!("push constants hold {} bytes, kernel reads {size}", self.push_constants.len()),
            });
        }
        Ok(bytemuck::pod_read_unaligned(&self.push_constants[..size]))
    }

    pub fn bytes(&self, binding: u32) -> Result<&[u8]> {
        match self.bindings.get(&binding) {
            Some(BoundResource::Buffer { data, .. }) => Ok(data),
            Some(BoundResource::Scene(_)) => Err(self.missing(binding, "is an acceleration structure")),
            None => Err(self.missing(binding, "nothing bound")),
        }
    }

    /// Typed copy of a bound range; trailing bytes that do not form a whole `T` are dropped.
    pub fn read<T: Pod>(&self, binding: u32) -> Result<Vec<T>> {
        let bytes = self.bytes(binding)?;
        let whole = bytes.len() / std::mem::size_of::<T>() * std::mem::size_of::<T>();
        Ok(bytemuck::pod_collect_to_vec(&bytes[..whole]))
    }

    pub fn bytes_mut(&mut self, binding: u32) -> Result<&mut [u8]> {
        let name = self.pipeline;
        match self.bindings.get_mut(&binding) {
            Some(BoundResource::Buffer { kind: BindingKind::StorageReadWrite, data, dirty }) => {
                *dirty = true;
                Ok(data)
            }
            Some(_) => Err(Error::Shader { name: name.to_string(), reason: format!("binding {binding} is read-only") }),
            None => Err(Error::Shader { name: name.to_string(), reason: format!("binding {binding}: nothing bound") }),
        }
    }

    /// Overwrite the start of a writable binding with `values`.
    pub fn write<T: Pod>(&mut self, binding: u32, values: &[T]) -> Result<()> {
        let src: &[u8] = bytemuck::cast_slice(values);
        let dst = self.bytes_mut(binding)?;
        if src.len() > dst.len() {
            return Err(Error::range(format!("kernel writes {} bytes into a {} byte binding", src.len(), dst.len())));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn scene(&self, binding: u32) -> Result<Arc<SceneView>> {
        match self.bindings.get(&binding) {
            Some(BoundResource::Scene(scene)) => Ok(Arc::clone(scene)),
            Some(_) => Err(self.missing(binding, "is not an acceleration structure")),
            None => Err(self.missing(binding, "nothing bound")),
        }
    }
}
