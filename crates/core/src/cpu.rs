//! CPU binding for the runtime thread
//!
//! Pinning the single runtime thread to one core keeps tick timing steady
//! under load.

/// Bind the current thread to `cpu_core`
pub fn bind_to_cpu_set(cpu_core: usize) -> Result<(), String> {
    #[cfg(feature = "cpu-binding")]
    {
        let core_ids = core_affinity::get_core_ids().ok_or_else(|| "Failed to get CPU core IDs".to_string())?;

        let core_id = core_ids
            .get(cpu_core)
            .copied()
            .ok_or_else(|| format!("CPU core {} not available ({} cores)", cpu_core, core_ids.len()))?;

        if core_affinity::set_for_current(core_id) {
            tracing::info!("Bound runtime thread to CPU core {}", cpu_core);
            Ok(())
        } else {
            Err(format!("Failed to bind to CPU core {cpu_core}"))
        }
    }

    #[cfg(not(feature = "cpu-binding"))]
    {
        if cpu_core >= get_cpu_count() {
            return Err(format!("CPU core {cpu_core} not available"));
        }
        tracing::warn!("CPU binding disabled (compile with --features cpu-binding), core {} not pinned", cpu_core);
        Ok(())
    }
}

/// Number of available CPU cores
pub fn get_cpu_count() -> usize {
    #[cfg(feature = "cpu-binding")]
    {
        core_affinity::get_core_ids().map(|cores| cores.len()).unwrap_or_else(num_cpus::get)
    }

    #[cfg(not(feature = "cpu-binding"))]
    {
        num_cpus::get()
    }
}
