//! Compute shaders and pipeline descriptions.
//!
//! Shader text is stored with overridable `#define`s. [`ComputeShader::new`]
//! injects the overrides (workgroup dimensions, bin counts, ...) and resolves
//! the preprocessor, so backends only ever see final source. Host devices run
//! the attached [`HostKernel`] instead of compiling the text.

use std::fmt;
use std::sync::Arc;

use crate::util::{Error, Result};

use super::host::HostKernel;
use super::types::DeviceLimits;

pub const WORKGROUP_SIZE_X_DEFINE: &str = "_NBL_GLSL_WORKGROUP_SIZE_X_";
pub const WORKGROUP_SIZE_Y_DEFINE: &str = "_NBL_GLSL_WORKGROUP_SIZE_Y_";
pub const WORKGROUP_SIZE_Z_DEFINE: &str = "_NBL_GLSL_WORKGROUP_SIZE_Z_";

/// What a pipeline binding slot holds and how the shader accesses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    StorageRead,
    StorageReadWrite,
    Uniform,
    AccelerationStructure,
}

impl BindingKind {
    pub fn is_buffer(self) -> bool {
        !matches!(self, Self::AccelerationStructure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingDesc {
    pub binding: u32,
    pub kind: BindingKind,
}

impl BindingDesc {
    pub const fn new(binding: u32, kind: BindingKind) -> Self {
        Self { binding, kind }
    }
}

/// Preprocessed compute shader plus its host implementation.
#[derive(Clone)]
pub struct ComputeShader {
    pub name: String,
    pub source: String,
    pub entry_point: String,
    pub workgroup_size: [u32; 3],
    pub host: Option<Arc<dyn HostKernel>>,
}

impl fmt::Debug for ComputeShader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeShader")
            .field("name", &self.name)
            .field("entry_point", &self.entry_point)
            .field("workgroup_size", &self.workgroup_size)
            .field("host", &self.host.is_some())
            .finish()
    }
}

impl ComputeShader {
    /// Inject workgroup-size overrides plus `extra` defines and preprocess.
    pub fn new(
        name: impl Into<String>,
        template: &str,
        workgroup_size: [u32; 3],
        extra: &[(&str, String)],
    ) -> Result<Self> {
        let name = name.into();
        let mut defines: Vec<(&str, String)> = vec![
            (WORKGROUP_SIZE_X_DEFINE, workgroup_size[0].to_string()),
            (WORKGROUP_SIZE_Y_DEFINE, workgroup_size[1].to_string()),
            (WORKGROUP_SIZE_Z_DEFINE, workgroup_size[2].to_string()),
        ];
        defines.extend(extra.iter().cloned());
        let source = shader_defines::resolve(template, &defines)
            .map_err(|e| Error::Shader { name: name.clone(), reason: e.to_string() })?;
        Ok(Self { name, source, entry_point: "main".into(), workgroup_size, host: None })
    }

    pub fn with_host_kernel(mut self, kernel: Arc<dyn HostKernel>) -> Self {
        self.host = Some(kernel);
        self
    }

    pub fn invocations(&self) -> u32 {
        self.workgroup_size.iter().product()
    }

    /// Workgroup size must fit the device limits.
    pub fn validate(&self, limits: &DeviceLimits) -> Result<()> {
        const AXES: [&str; 3] = ["size x", "size y", "size z"];
        for axis in 0..3 {
            let requested = self.workgroup_size[axis];
            if requested == 0 {
                return Err(Error::Shader { name: self.name.clone(), reason: "zero workgroup size".into() });
            }
            if requested > limits.max_compute_workgroup_size[axis] {
                return Err(Error::WorkgroupLimit {
                    what: AXES[axis].into(),
                    requested,
                    limit: limits.max_compute_workgroup_size[axis],
                });
            }
        }
        if self.invocations() > limits.max_compute_workgroup_invocations {
            return Err(Error::WorkgroupLimit {
                what: "invocations".into(),
                requested: self.invocations(),
                limit: limits.max_compute_workgroup_invocations,
            });
        }
        Ok(())
    }
}

/// Compute pipeline creation parameters.
#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub label: String,
    pub shader: ComputeShader,
    pub bindings: Vec<BindingDesc>,
    /// Size of the push-constant block in bytes, 0 for none.
    pub push_constant_size: u32,
}

impl ComputePipelineDesc {
    pub fn binding(&self, binding: u32) -> Option<BindingKind> {
        self.bindings.iter().find(|b| b.binding == binding).map(|b| b.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "// test kernel\n\
        #ifndef _NBL_GLSL_WORKGROUP_SIZE_X_\n\
        #define _NBL_GLSL_WORKGROUP_SIZE_X_ 16\n\
        #endif\n\
        @compute @workgroup_size(_NBL_GLSL_WORKGROUP_SIZE_X_, _NBL_GLSL_WORKGROUP_SIZE_Y_, _NBL_GLSL_WORKGROUP_SIZE_Z_)\n\
        fn main() { let bins = BIN_COUNT; }\n";

    #[test]
    fn test_overrides_are_resolved() {
        let shader = ComputeShader::new("t", TEMPLATE, [8, 4, 1], &[("BIN_COUNT", "256u".into())]).unwrap();
        assert!(shader.source.contains("@workgroup_size(8, 4, 1)"));
        assert!(shader.source.contains("let bins = 256u;"));
        assert_eq!(shader.invocations(), 32);
    }

    #[test]
    fn test_workgroup_limits() {
        let limits = DeviceLimits::default();
        let ok = ComputeShader::new("ok", TEMPLATE, [16, 16, 1], &[]).unwrap();
        assert!(ok.validate(&limits).is_ok());

        let too_many = ComputeShader::new("big", TEMPLATE, [32, 32, 1], &[]).unwrap();
        assert!(matches!(too_many.validate(&limits), Err(Error::WorkgroupLimit { .. })));

        let too_deep = ComputeShader::new("deep", TEMPLATE, [1, 1, 128], &[]).unwrap();
        assert!(matches!(too_deep.validate(&limits), Err(Error::WorkgroupLimit { .. })));
    }
}
