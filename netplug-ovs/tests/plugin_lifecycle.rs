//! End-to-end plugin lifecycle against the in-memory state driver, with
//! recording fakes standing in for ovs-vsctl and tc.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use netplug_core::config::StateConfig;
use netplug_core::error::{ResourceError, StateError};
use netplug_core::resource::{StateResourceManager, VLAN_TAG_POOL, VXLAN_TAG_POOL};
use netplug_core::state::RawWatchEvent;
use netplug_core::{DriverError, MemStateDriver, StateAccess, StateDriver, WatchStream};
use netplug_ovs::{
    GLOBAL_POOL, OvsCfgEndpointState, OvsCfgNetworkState, OvsEndpointDriver, OvsError,
    OvsNetworkDriver, OvsOperEndpointState, OvsOperNetworkState, OvsPlugin, OvsSwitch, PktTagType,
    TrafficError, TrafficShaper,
};

type RacingCreate = (StateAccess<OvsOperEndpointState>, OvsOperEndpointState);

#[derive(Default)]
struct FakeSwitch {
    ops: Mutex<Vec<String>>,
    fail_add_port: bool,
    /// Oper entity another agent records while our port is being added.
    racing_create: Mutex<Option<RacingCreate>>,
}

impl FakeSwitch {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl OvsSwitch for FakeSwitch {
    fn bridge(&self) -> &str {
        "contivbr"
    }

    async fn ensure_bridge(&self) -> Result<(), OvsError> {
        self.ops.lock().unwrap().push("add-br contivbr".into());
        Ok(())
    }

    async fn add_port(&self, name: &str, tag: u32) -> Result<(), OvsError> {
        if self.fail_add_port {
            return Err(OvsError::Command {
                command: format!("add-port {}", name),
                stderr: "no such bridge".into(),
            });
        }
        self.ops
            .lock()
            .unwrap()
            .push(format!("add-port {} tag={}", name, tag));
        let racing = self.racing_create.lock().unwrap().take();
        if let Some((oper, winner)) = racing {
            oper.create(&winner).await.unwrap();
        }
        Ok(())
    }

    async fn delete_port(&self, name: &str) -> Result<(), OvsError> {
        self.ops.lock().unwrap().push(format!("del-port {}", name));
        Ok(())
    }
}

#[derive(Default)]
struct FakeShaper {
    applied: Mutex<Vec<(String, u64)>>,
    fail: bool,
}

#[async_trait]
impl TrafficShaper for FakeShaper {
    async fn set_bandwidth(&self, iface: &str, bits_per_sec: u64) -> Result<(), TrafficError> {
        if self.fail {
            return Err(TrafficError::Install {
                iface: iface.to_string(),
                stderr: "RTNETLINK answers: No such device".into(),
            });
        }
        self.applied
            .lock()
            .unwrap()
            .push((iface.to_string(), bits_per_sec));
        Ok(())
    }
}

/// In-memory store whose next conditional delete under a prefix fails.
#[derive(Default)]
struct FlakyStore {
    inner: MemStateDriver,
    fail_clear_under: Mutex<Option<String>>,
}

impl FlakyStore {
    fn fail_next_clear_under(&self, prefix: &str) {
        *self.fail_clear_under.lock().unwrap() = Some(prefix.to_string());
    }
}

#[async_trait]
impl StateDriver for FlakyStore {
    async fn init(&self, config: &StateConfig) -> Result<(), StateError> {
        self.inner.init(config).await
    }

    async fn deinit(&self) {
        self.inner.deinit().await
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), StateError> {
        self.inner.write(key, value).await
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StateError> {
        self.inner.read(key).await
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StateError> {
        self.inner.read_all(prefix).await
    }

    async fn watch_all(&self, prefix: &str) -> Result<WatchStream<RawWatchEvent>, StateError> {
        self.inner.watch_all(prefix).await
    }

    async fn clear(&self, key: &str) -> Result<(), StateError> {
        self.inner.clear(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<(), StateError> {
        self.inner.compare_and_swap(key, expected, value).await
    }

    async fn compare_and_clear(&self, key: &str, expected: &[u8]) -> Result<(), StateError> {
        let fail = {
            let mut prefix = self.fail_clear_under.lock().unwrap();
            if prefix.as_deref().is_some_and(|p| key.starts_with(p)) {
                *prefix = None;
                true
            } else {
                false
            }
        };
        if fail {
            return Err(StateError::StoreUnavailable(key.to_string()));
        }
        self.inner.compare_and_clear(key, expected).await
    }
}

struct Harness {
    plugin: OvsPlugin,
    driver: Arc<dyn StateDriver>,
    switch: Arc<FakeSwitch>,
    shaper: Arc<FakeShaper>,
    nets: StateAccess<OvsCfgNetworkState>,
    eps: StateAccess<OvsCfgEndpointState>,
}

async fn harness(switch: FakeSwitch, shaper: FakeShaper) -> Harness {
    harness_on(Arc::new(MemStateDriver::new()), switch, shaper).await
}

async fn harness_on(
    driver: Arc<dyn StateDriver>,
    switch: FakeSwitch,
    shaper: FakeShaper,
) -> Harness {
    let switch = Arc::new(switch);
    let shaper = Arc::new(shaper);

    let plugin = OvsPlugin::new(
        Arc::clone(&driver),
        Arc::new(OvsNetworkDriver::new(switch.clone())),
        Arc::new(OvsEndpointDriver::new(switch.clone(), shaper.clone())),
    );
    plugin
        .init_from_str(
            r#"{
                "plugin-instance": {"host-label": "host1"},
                "ovs": {"vlan-range": "100-199", "vxlan-range": "5000-5099"}
            }"#,
        )
        .await
        .unwrap();

    Harness {
        plugin,
        nets: StateAccess::new(Arc::clone(&driver)),
        eps: StateAccess::new(Arc::clone(&driver)),
        driver,
        switch,
        shaper,
    }
}

async fn default_harness() -> Harness {
    harness(FakeSwitch::default(), FakeShaper::default()).await
}

fn vxlan_net(id: &str) -> OvsCfgNetworkState {
    OvsCfgNetworkState::new(id, PktTagType::Vxlan, "10.1.0.0/24".parse().unwrap())
        .with_tenant("default")
        .with_gateway("10.1.0.1".parse().unwrap())
}

fn vlan_net(id: &str, pkt_tag: u32) -> OvsCfgNetworkState {
    OvsCfgNetworkState::new(id, PktTagType::Vlan, "10.2.0.0/24".parse().unwrap())
        .with_tags(pkt_tag, 0)
}

async fn oper_net(h: &Harness, id: &str) -> OvsOperNetworkState {
    StateAccess::<OvsOperNetworkState>::new(Arc::clone(&h.driver))
        .read(id)
        .await
        .unwrap()
}

async fn endpoint_ip(h: &Harness, id: &str) -> String {
    StateAccess::<OvsOperEndpointState>::new(Arc::clone(&h.driver))
        .read(id)
        .await
        .unwrap()
        .ip_address
        .to_string()
}

async fn allocated(driver: &Arc<dyn StateDriver>, pool: &str) -> usize {
    let rm = StateResourceManager::new(Arc::clone(driver));
    rm.list_resources()
        .await
        .unwrap()
        .into_iter()
        .find(|u| u.id == GLOBAL_POOL && u.description == pool)
        .map(|u| u.allocated)
        .unwrap()
}

#[tokio::test]
async fn test_network_config_roundtrip_through_read_all() {
    let h = default_harness().await;
    let net = OvsCfgNetworkState::new("net1", PktTagType::Vxlan, "10.1.0.0/24".parse().unwrap());

    h.nets.write(&net).await.unwrap();
    let all: Vec<_> = h
        .nets
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(all, vec![net]);

    h.nets.clear("net1").await.unwrap();
    assert!(h.nets.read_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_network_allocates_tags() {
    let h = default_harness().await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();

    h.plugin.create_network("net1").await.unwrap();
    // Repeated create is a no-op.
    h.plugin.create_network("net1").await.unwrap();

    let oper = StateAccess::<OvsOperNetworkState>::new(Arc::clone(&h.driver))
        .read("net1")
        .await
        .unwrap();
    assert_eq!(oper.pkt_tag, 100);
    assert_eq!(oper.ext_pkt_tag, 5000);
    assert!(oper.pkt_tag_pooled && oper.ext_pkt_tag_pooled);
    assert_eq!(oper.bridge, "contivbr");

    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 1);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 1);

    let fetched = h.plugin.fetch_network("net1").await.unwrap();
    assert_eq!(fetched, vxlan_net("net1"));
}

#[tokio::test]
async fn test_explicit_tag_in_range_is_reserved() {
    let h = default_harness().await;

    h.nets.write(&vlan_net("a", 100)).await.unwrap();
    h.plugin.create_network("a").await.unwrap();
    let a = oper_net(&h, "a").await;
    assert_eq!((a.pkt_tag, a.ext_pkt_tag), (100, 100));
    assert!(a.pkt_tag_pooled);
    assert!(!a.ext_pkt_tag_pooled);
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 1);

    // Pool allocation skips the reserved tag.
    h.nets.write(&vlan_net("b", 0)).await.unwrap();
    h.plugin.create_network("b").await.unwrap();
    assert_eq!(oper_net(&h, "b").await.pkt_tag, 101);

    // A second network asking for the same tag is refused.
    h.nets.write(&vlan_net("c", 100)).await.unwrap();
    assert!(matches!(
        h.plugin.create_network("c").await,
        Err(DriverError::Resource(ResourceError::InvalidValue { .. }))
    ));
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 2);

    // Outside the pool range the tag is the operator's business.
    h.nets.write(&vlan_net("d", 42)).await.unwrap();
    h.plugin.create_network("d").await.unwrap();
    let d = oper_net(&h, "d").await;
    assert_eq!((d.pkt_tag, d.ext_pkt_tag), (42, 42));
    assert!(!d.pkt_tag_pooled);
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 2);

    h.plugin.delete_network("a").await.unwrap();
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 1);
    h.nets.write(&vlan_net("f", 0)).await.unwrap();
    h.plugin.create_network("f").await.unwrap();
    assert_eq!(oper_net(&h, "f").await.pkt_tag, 100);
}

#[tokio::test]
async fn test_explicit_vni_is_reserved() {
    let h = default_harness().await;

    h.nets
        .write(&vxlan_net("a").with_tags(0, 5003))
        .await
        .unwrap();
    h.plugin.create_network("a").await.unwrap();
    let a = oper_net(&h, "a").await;
    assert_eq!((a.pkt_tag, a.ext_pkt_tag), (100, 5003));
    assert!(a.pkt_tag_pooled && a.ext_pkt_tag_pooled);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 1);

    // Losing the VNI gives back the internal tag taken for it.
    h.nets
        .write(&vxlan_net("b").with_tags(0, 5003))
        .await
        .unwrap();
    assert!(h.plugin.create_network("b").await.is_err());
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 1);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 1);

    h.plugin.delete_network("a").await.unwrap();
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 0);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 0);
}

#[tokio::test]
async fn test_endpoint_lifecycle() {
    let h = default_harness().await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();

    let mut ep = OvsCfgEndpointState::new("ep1", "net1", "host1");
    ep.bandwidth = Some(10_000_000);
    h.eps.write(&ep).await.unwrap();
    h.plugin.create_endpoint("ep1").await.unwrap();

    let oper = StateAccess::<OvsOperEndpointState>::new(Arc::clone(&h.driver))
        .read("ep1")
        .await
        .unwrap();
    assert_eq!(oper.ip_address.to_string(), "10.1.0.2");
    assert_eq!(oper.pkt_tag, 100);
    assert_eq!(oper.port_name, "cv-ep1");
    assert_eq!(oper.home_host, "host1");
    assert!(h.switch.ops().contains(&"add-port cv-ep1 tag=100".to_string()));
    assert_eq!(
        *h.shaper.applied.lock().unwrap(),
        vec![("cv-ep1".to_string(), 10_000_000)]
    );
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 1);

    assert!(matches!(
        h.plugin.delete_network("net1").await,
        Err(DriverError::InUse(_))
    ));

    h.plugin.delete_endpoint("ep1").await.unwrap();
    assert!(h.switch.ops().contains(&"del-port cv-ep1".to_string()));
    let net = h.nets.read("net1").await.unwrap();
    assert_eq!(net.ep_count, 0);
    assert_eq!(net.free_ips(), 253);
    assert!(h.plugin.fetch_endpoint("ep1").await.unwrap_err().is_not_found());

    h.plugin.delete_network("net1").await.unwrap();
    assert!(h.plugin.fetch_network("net1").await.unwrap_err().is_not_found());
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 0);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 0);
}

#[tokio::test]
async fn test_endpoint_requires_active_network() {
    let h = default_harness().await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.eps
        .write(&OvsCfgEndpointState::new("ep1", "net1", "host1"))
        .await
        .unwrap();

    assert!(matches!(
        h.plugin.create_endpoint("ep1").await,
        Err(DriverError::NotReady(_))
    ));
    assert!(!h.switch.ops().iter().any(|op| op.starts_with("add-port")));
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 0);
}

#[tokio::test]
async fn test_requested_ip_is_reserved() {
    let h = default_harness().await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();

    let mut a = OvsCfgEndpointState::new("a", "net1", "host1");
    a.ip_address = Some("10.1.0.50".parse().unwrap());
    h.eps.write(&a).await.unwrap();
    h.plugin.create_endpoint("a").await.unwrap();

    let mut b = OvsCfgEndpointState::new("b", "net1", "host1");
    b.ip_address = Some("10.1.0.50".parse().unwrap());
    h.eps.write(&b).await.unwrap();
    assert!(matches!(
        h.plugin.create_endpoint("b").await,
        Err(DriverError::Resource(_))
    ));
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 1);
}

#[tokio::test]
async fn test_shaping_failure_rolls_back() {
    let h = harness(
        FakeSwitch::default(),
        FakeShaper {
            fail: true,
            ..Default::default()
        },
    )
    .await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();

    let mut ep = OvsCfgEndpointState::new("ep1", "net1", "host1");
    ep.bandwidth = Some(1_000_000);
    h.eps.write(&ep).await.unwrap();

    assert!(matches!(
        h.plugin.create_endpoint("ep1").await,
        Err(DriverError::Traffic(_))
    ));
    let ops = h.switch.ops();
    assert!(ops.contains(&"add-port cv-ep1 tag=100".to_string()));
    assert!(ops.contains(&"del-port cv-ep1".to_string()));

    let net = h.nets.read("net1").await.unwrap();
    assert_eq!(net.ep_count, 0);
    assert_eq!(net.free_ips(), 253);
    assert!(
        StateAccess::<OvsOperEndpointState>::new(Arc::clone(&h.driver))
            .try_read("ep1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_port_failure_releases_address() {
    let h = harness(
        FakeSwitch {
            fail_add_port: true,
            ..Default::default()
        },
        FakeShaper::default(),
    )
    .await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();
    h.eps
        .write(&OvsCfgEndpointState::new("ep1", "net1", "host1"))
        .await
        .unwrap();

    assert!(matches!(
        h.plugin.create_endpoint("ep1").await,
        Err(DriverError::Switch(_))
    ));
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 0);
}

#[tokio::test]
async fn test_deinit_stops_operations() {
    let h = default_harness().await;
    let mac = h.plugin.make_endpoint_address().unwrap();
    assert_eq!(mac.as_str().len(), 17);

    h.plugin.deinit().await;
    assert!(matches!(
        h.plugin.create_network("net1").await,
        Err(DriverError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_retried_endpoint_delete_releases_address_once() {
    let store = Arc::new(FlakyStore::default());
    let h = harness_on(store.clone(), FakeSwitch::default(), FakeShaper::default()).await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();
    for id in ["e1", "e2", "e3"] {
        h.eps
            .write(&OvsCfgEndpointState::new(id, "net1", "host1"))
            .await
            .unwrap();
    }

    h.plugin.create_endpoint("e1").await.unwrap();
    assert_eq!(endpoint_ip(&h, "e1").await, "10.1.0.2");

    store.fail_next_clear_under("/contiv/oper/eps/");
    assert!(h.plugin.delete_endpoint("e1").await.is_err());
    // The address stays with e1 until its record is gone.
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 1);

    h.plugin.create_endpoint("e2").await.unwrap();
    assert_eq!(endpoint_ip(&h, "e2").await, "10.1.0.3");

    h.plugin.delete_endpoint("e1").await.unwrap();
    h.plugin.delete_endpoint("e1").await.unwrap();
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 1);

    h.plugin.create_endpoint("e3").await.unwrap();
    let e3 = endpoint_ip(&h, "e3").await;
    assert_ne!(e3, endpoint_ip(&h, "e2").await);
    assert_eq!(e3, "10.1.0.2");
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 2);
}

#[tokio::test]
async fn test_retried_network_delete_releases_tags_once() {
    let store = Arc::new(FlakyStore::default());
    let h = harness_on(store.clone(), FakeSwitch::default(), FakeShaper::default()).await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();

    store.fail_next_clear_under("/contiv/oper/nets/");
    assert!(h.plugin.delete_network("net1").await.is_err());
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 1);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 1);
    assert!(h.nets.read("net1").await.unwrap().deleting);

    h.plugin.delete_network("net1").await.unwrap();
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 0);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 0);

    // A later network takes the freed tags; a stale delete must not free them.
    h.nets.write(&vxlan_net("net2")).await.unwrap();
    h.plugin.create_network("net2").await.unwrap();
    h.plugin.delete_network("net1").await.unwrap();
    let net2 = oper_net(&h, "net2").await;
    assert_eq!((net2.pkt_tag, net2.ext_pkt_tag), (100, 5000));
    assert_eq!(allocated(&h.driver, VLAN_TAG_POOL).await, 1);
    assert_eq!(allocated(&h.driver, VXLAN_TAG_POOL).await, 1);
}

#[tokio::test]
async fn test_network_being_deleted_refuses_endpoints() {
    let h = default_harness().await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();
    h.eps
        .write(&OvsCfgEndpointState::new("ep1", "net1", "host1"))
        .await
        .unwrap();

    h.nets
        .update("net1", |net| {
            net.deleting = true;
            Ok::<(), StateError>(())
        })
        .await
        .unwrap();

    assert!(matches!(
        h.plugin.create_endpoint("ep1").await,
        Err(DriverError::NotReady(_))
    ));
    assert!(!h.switch.ops().iter().any(|op| op.starts_with("add-port")));
    assert_eq!(h.nets.read("net1").await.unwrap().ep_count, 0);

    h.nets.write(&vxlan_net("net2")).await.unwrap();
    h.nets
        .update("net2", |net| {
            net.deleting = true;
            Ok::<(), StateError>(())
        })
        .await
        .unwrap();
    assert!(matches!(
        h.plugin.create_network("net2").await,
        Err(DriverError::NotReady(_))
    ));
}

#[tokio::test]
async fn test_losing_concurrent_create_keeps_winner_port() {
    let h = default_harness().await;
    h.nets.write(&vxlan_net("net1")).await.unwrap();
    h.plugin.create_network("net1").await.unwrap();
    h.eps
        .write(&OvsCfgEndpointState::new("ep1", "net1", "host1"))
        .await
        .unwrap();

    let ep_oper = StateAccess::<OvsOperEndpointState>::new(Arc::clone(&h.driver));
    let winner = OvsOperEndpointState {
        id: "ep1".into(),
        net_id: "net1".into(),
        port_name: "cv-ep1".into(),
        ip_address: "10.1.0.9".parse().unwrap(),
        mac_address: "02:00:00:00:00:09".into(),
        pkt_tag: 100,
        home_host: "host1".into(),
        bandwidth: None,
        provisioned_at: Utc::now(),
    };
    *h.switch.racing_create.lock().unwrap() = Some((ep_oper.clone(), winner.clone()));

    h.plugin.create_endpoint("ep1").await.unwrap();

    let ops = h.switch.ops();
    assert!(ops.contains(&"add-port cv-ep1 tag=100".to_string()));
    assert!(!ops.iter().any(|op| op.starts_with("del-port")));
    assert_eq!(ep_oper.read("ep1").await.unwrap(), winner);

    let net = h.nets.read("net1").await.unwrap();
    assert_eq!(net.ep_count, 0);
    assert_eq!(net.free_ips(), 253);
}
