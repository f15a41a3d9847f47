use anyhow::Result;
use candle_core::{DType, Device};
use std::env;
use tracing::{debug, info, warn};

use crate::plugin::Precision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Metal,
    Cuda(usize), // device ordinal
    Cpu,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Metal => "metal",
            BackendType::Cuda(_) => "cuda",
            BackendType::Cpu => "cpu",
        }
    }
}

pub struct DeviceManager {
    backend_type: BackendType,
    primary_device: Device,
}

impl DeviceManager {
    /// `ordinal` selects the accelerator, normally the process's local rank.
    pub fn new(backend_type: &str, ordinal: usize) -> Result<Self> {
        match backend_type {
            "metal" => Ok(Self::new_metal(ordinal)),
            "cuda" => Ok(Self::new_cuda(ordinal)),
            "cpu" => Ok(Self::new_cpu()),
            _ => Err(anyhow::anyhow!("Unsupported backend type: {}", backend_type)),
        }
    }

    fn new_metal(ordinal: usize) -> Self {
        info!("🔍 Attempting to initialize Metal backend...");
        debug!("Metal feature enabled: {}", cfg!(feature = "metal"));

        match Device::new_metal(ordinal) {
            Ok(device) => {
                info!("🖥️  Successfully initialized Metal backend");
                Self {
                    backend_type: BackendType::Metal,
                    primary_device: device,
                }
            }
            Err(e) => {
                warn!("❌ Metal device creation failed: {}", e);
                info!("📝 Falling back to CPU backend");
                Self::new_cpu()
            }
        }
    }

    fn new_cuda(ordinal: usize) -> Self {
        debug!("CUDA feature enabled: {}", cfg!(feature = "cuda"));

        match Device::new_cuda(ordinal) {
            Ok(device) => {
                info!("🚀 Initialized CUDA device {}", ordinal);
                Self {
                    backend_type: BackendType::Cuda(ordinal),
                    primary_device: device,
                }
            }
            Err(e) => {
                warn!("❌ CUDA device {} creation failed: {}", ordinal, e);
                info!("📝 Falling back to CPU backend");
                Self::new_cpu()
            }
        }
    }

    fn new_cpu() -> Self {
        info!("💻 Using CPU backend");
        Self {
            backend_type: BackendType::Cpu,
            primary_device: Device::Cpu,
        }
    }

    pub fn primary_device(&self) -> &Device {
        &self.primary_device
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self.backend_type, BackendType::Cuda(_))
    }

    /// Parameter dtype for a plugin's precision on this backend. Reduced
    /// precision training is only run on CUDA; other backends train in f32.
    pub fn training_dtype(&self, precision: Precision) -> DType {
        match (self.backend_type, precision) {
            (BackendType::Cuda(_), Precision::Bf16) => DType::BF16,
            (BackendType::Cuda(_), Precision::Fp16) => DType::F16,
            (_, Precision::Fp32) => DType::F32,
            (backend, precision) => {
                warn!(
                    "⚠️ {:?} training is not supported on the {} backend, using f32",
                    precision,
                    backend.as_str()
                );
                DType::F32
            }
        }
    }
}

/// Process placement inside a multi-process launch.
///
/// Reads the `RANK`, `LOCAL_RANK` and `WORLD_SIZE` variables set by torchrun
/// style launchers; a bare invocation is rank 0 of 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistCoordinator {
    rank: usize,
    local_rank: usize,
    world_size: usize,
}

impl DistCoordinator {
    pub fn new(rank: usize, local_rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(anyhow::anyhow!("WORLD_SIZE must be positive"));
        }
        if rank >= world_size {
            return Err(anyhow::anyhow!("RANK {} is outside WORLD_SIZE {}", rank, world_size));
        }
        Ok(Self { rank, local_rank, world_size })
    }

    pub fn single_process() -> Self {
        Self { rank: 0, local_rank: 0, world_size: 1 }
    }

    pub fn from_env() -> Result<Self> {
        let rank = read_env_usize("RANK")?.unwrap_or(0);
        let world_size = read_env_usize("WORLD_SIZE")?.unwrap_or(1);
        let local_rank = read_env_usize("LOCAL_RANK")?.unwrap_or(rank);
        let coordinator = Self::new(rank, local_rank, world_size)?;
        debug!("Coordinator: {:?}", coordinator);
        Ok(coordinator)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    pub fn print_on_master(&self, message: &str) {
        if self.is_master() {
            println!("{}", message);
        }
    }
}

fn read_env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", name, value, e)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::anyhow!("Cannot read {}: {}", name, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_backend_trains_in_f32() {
        let manager = DeviceManager::new("cpu", 0).unwrap();
        assert!(!manager.is_cuda());
        assert!(manager.primary_device().is_cpu());
        assert_eq!(manager.training_dtype(Precision::Bf16), DType::F32);
        assert_eq!(manager.training_dtype(Precision::Fp16), DType::F32);
        assert_eq!(manager.training_dtype(Precision::Fp32), DType::F32);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(DeviceManager::new("tpu", 0).is_err());
    }

    #[test]
    fn coordinator_validates_rank() {
        assert!(DistCoordinator::new(2, 0, 2).is_err());
        assert!(DistCoordinator::new(0, 0, 0).is_err());

        let coordinator = DistCoordinator::new(1, 1, 4).unwrap();
        assert!(!coordinator.is_master());
        assert_eq!(coordinator.world_size(), 4);
        assert!(DistCoordinator::single_process().is_master());
    }
}
