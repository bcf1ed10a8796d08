use std::sync::Arc;

use crate::container_driver::ContainerDriver;
use crate::health::HealthAggregator;
use crate::platform_bridge::PlatformBridge;
use crate::scheduler::Scheduler;
use crate::session_service::SessionService;
use crate::store::SessionStore;
use crate::task_service::TaskService;
use common::bus::BusClient;

pub struct AppState {
    pub sessions: SessionService,
    pub tasks: TaskService,
    pub platform: PlatformBridge,
    pub scheduler: Scheduler,
    pub health: HealthAggregator,
    pub bus: BusClient,
    pub session_store: SessionStore,
    pub containers: ContainerDriver,
}

pub type SharedState = Arc<AppState>;
