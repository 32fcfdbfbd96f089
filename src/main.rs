use std::sync::Arc;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swarm_vins::config::EstimatorConfig;
use swarm_vins::estimator::EstimatorState;
use swarm_vins::imu::ImuInitState;
use swarm_vins::optimizer::DenseGaussNewton;
use swarm_vins::sim::SyntheticRun;
use swarm_vins::system::{RemoteMsg, RemoteSync};
use swarm_vins::types::{AgentId, CamId};

/// Frames processed per agent.
const NUM_FRAMES: usize = 40;

/// Capacity of the remote update channel.
const REMOTE_CHANNEL_CAPACITY: usize = 32;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EstimatorConfig::from_yaml(&path)?,
        None => EstimatorConfig::default(),
    };
    config.validate().context("invalid estimator configuration")?;

    let local = SyntheticRun::new(config.local_agent, CamId(0), 1);
    let mut remote = SyntheticRun::new(AgentId(config.local_agent.0 + 1), CamId(1), 10_000);
    remote.trajectory.origin = Vector3::new(1.5, -1.0, 0.4);
    remote.trajectory.frequency = Vector3::new(1.4, 1.1, 1.7);
    remote.pixel_noise = 5e-4;

    let state = Arc::new(EstimatorState::new(config.clone()));
    if !state.has_camera(local.camera) {
        state.add_camera(local.extrinsic, 0, local.agent, Some(local.camera));
    }
    if !state.has_camera(remote.camera) {
        state.add_camera(remote.extrinsic, 0, remote.agent, Some(remote.camera));
    }

    let mut sync = RemoteSync::spawn(Arc::clone(&state), REMOTE_CHANNEL_CAPACITY);
    let optimizer = DenseGaussNewton::default();
    info!(
        "running {} frames for {} (local) and {} (remote)",
        NUM_FRAMES, local.agent, remote.agent
    );

    for k in 0..NUM_FRAMES {
        // Local front end: frame plus the IMU slice since the previous frame.
        let (desc, imu) = local.frame(k, true);
        state.push_frame(&desc, imu)?;

        // Remote agent: frame description here, IMU and window over the link.
        let (desc, _) = remote.frame(k, true);
        state.push_frame(&desc, Default::default())?;
        if k > 0 {
            let samples = remote
                .trajectory
                .imu_between(remote.stamp(k - 1), remote.stamp(k));
            sync.try_send(RemoteMsg::Imu {
                agent: remote.agent,
                samples,
            });
        }
        let first = k.saturating_sub(config.max_sliding_window - 1);
        sync.try_send(RemoteMsg::Window {
            agent: remote.agent,
            frame_ids: (first..=k).map(|i| remote.frame_id(i)).collect(),
        });

        if state.init_state() != ImuInitState::Initialized {
            if state.size(local.agent) >= config.alignment.min_init_frames {
                if let Err(e) = state.mono_initialization() {
                    warn!("frame {}: initialization deferred: {}", k, e);
                }
            }
            if state.init_state() != ImuInitState::Initialized {
                state.clear_useless_frames(false)?;
                continue;
            }
        }

        match state.solve_with(&optimizer, &sync.imu_snapshot()) {
            Ok(report) => info!(
                "frame {}: cost {:.4} -> {:.4} in {} iterations",
                k, report.initial_cost, report.final_cost, report.iterations
            ),
            Err(e) => warn!("frame {}: solve failed: {}", k, e),
        }
        state.clear_useless_frames(true)?;

        if let Some(last) = state.last_frame(local.agent) {
            let truth = local.true_odometry(k).pose;
            let error = (last.odom.pose.translation - truth.translation).norm();
            info!("frame {}: {} position error {:.4} m", k, last.id, error);
        }
    }

    sync.shutdown();
    println!("{}", state.print_sld_win());
    let stats = state.marginalization_stats();
    println!(
        "marginalized {} frames ({} degraded, {} discarded), {} landmarks",
        stats.marginalized,
        stats.degraded,
        stats.discarded,
        state.num_landmarks()
    );
    Ok(())
}
