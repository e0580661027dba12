use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::apis::NodePool;
use crate::providers::provider::{CloudProvider, ProviderError};
use crate::requirements::{
    LABEL_ARCH, LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_OS, LABEL_ZONE, Requirements,
};
use crate::resources::{CPU, MEMORY, ResourceList};

/// How an instance is paid for. Newtype-free: the set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapacityType {
    OnDemand,
    Spot,
    Reserved,
}

impl CapacityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Spot => "spot",
            Self::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One purchasable shape of an instance type: a (zone, capacity-type,
/// price) triple plus current availability.
#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub zone: String,
    pub capacity_type: CapacityType,
    pub price: f64,
    pub available: bool,
}

/// An instance type as advertised by the provider: raw capacity, the
/// labels it will carry, and its offerings ordered by price.
#[derive(Debug, Clone)]
pub struct InstanceType {
    pub name: String,
    pub arch: String,
    pub capacity: ResourceList,
    pub offerings: Vec<Offering>,
}

/// Reservations subtracted from raw capacity before scheduling.
#[derive(Debug, Clone, Copy)]
pub struct OverheadSettings {
    /// Fraction of memory the hypervisor hides from the guest, 0.0..1.0.
    pub vm_memory_overhead_percent: f64,
}

impl Default for OverheadSettings {
    fn default() -> Self {
        Self {
            vm_memory_overhead_percent: 0.075,
        }
    }
}

/// Flat kubelet + system reservations. Small instances feel these;
/// large ones barely notice.
const RESERVED_CPU_MILLIS: i64 = 100;
const RESERVED_MEMORY_MILLIS: i64 = 100 * 1024 * 1024 * 1000;

impl InstanceType {
    /// Capacity minus kubelet/system reservations and VM memory overhead.
    pub fn allocatable(&self, overhead: &OverheadSettings) -> ResourceList {
        let mut out = self.capacity.clone();
        let memory = out.get(MEMORY);
        let vm_overhead = (memory as f64 * overhead.vm_memory_overhead_percent) as i64;
        let reserved = ResourceList::new()
            .with(CPU, RESERVED_CPU_MILLIS)
            .with(MEMORY, RESERVED_MEMORY_MILLIS + vm_overhead);
        out = out.saturating_sub(&reserved);
        out
    }

    /// The labels a node of this type carries, as a requirement set the
    /// simulator can intersect with pod and pool requirements.
    pub fn requirements(&self) -> Requirements {
        let mut reqs = Requirements::new();
        reqs.insert_label(LABEL_INSTANCE_TYPE, &self.name);
        reqs.insert_label(LABEL_ARCH, &self.arch);
        reqs.insert_label(LABEL_OS, "linux");
        reqs
    }

    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self
            .offerings
            .iter()
            .filter(|o| o.available)
            .map(|o| o.zone.clone())
            .collect();
        zones.sort();
        zones.dedup();
        zones
    }

    pub fn capacity_types(&self) -> Vec<CapacityType> {
        let mut cts: Vec<CapacityType> = self
            .offerings
            .iter()
            .filter(|o| o.available)
            .map(|o| o.capacity_type)
            .collect();
        cts.sort();
        cts.dedup();
        cts
    }

    /// Cheapest available offering compatible with zone / capacity-type
    /// requirements. Ties break by zone name for determinism.
    pub fn cheapest_offering(&self, reqs: &Requirements) -> Option<&Offering> {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .filter(|o| offering_compatible(o, reqs))
            .min_by(|a, b| {
                a.price
                    .partial_cmp(&b.price)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.zone.cmp(&b.zone))
            })
    }
}

/// Cheapest (instance type, offering) pair admitted by a requirement set.
/// Price first, then instance-type name, then zone, so resolution is
/// deterministic across providers.
pub fn resolve_cheapest<'a>(
    types: &'a [InstanceType],
    reqs: &Requirements,
) -> Option<(&'a InstanceType, &'a Offering)> {
    let mut best: Option<(&InstanceType, &Offering)> = None;
    for it in types {
        if !reqs.compatible(&it.requirements()) {
            continue;
        }
        let Some(offering) = it.cheapest_offering(reqs) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((bt, bo)) => {
                (offering.price, it.name.as_str(), offering.zone.as_str())
                    < (bo.price, bt.name.as_str(), bo.zone.as_str())
            }
        };
        if better {
            best = Some((it, offering));
        }
    }
    best
}

pub fn offering_compatible(offering: &Offering, reqs: &Requirements) -> bool {
    let labels = BTreeMap::from([
        (LABEL_ZONE.to_string(), offering.zone.clone()),
        (
            LABEL_CAPACITY_TYPE.to_string(),
            offering.capacity_type.as_str().to_string(),
        ),
    ]);
    // Only the zone/capacity-type keys are checked here; the caller has
    // already intersected instance-type level requirements.
    [LABEL_ZONE, LABEL_CAPACITY_TYPE].iter().all(|key| {
        reqs.get(key)
            .is_none_or(|kr| kr.admits(labels.get(*key).unwrap()))
    })
}

#[derive(Debug, Clone)]
struct UnavailableOffering {
    instance_type: String,
    zone: String,
    capacity_type: CapacityType,
    until: Instant,
}

struct CachedTypes {
    fetched_at: Instant,
    types: Arc<Vec<InstanceType>>,
}

struct CatalogState {
    by_pool: BTreeMap<String, CachedTypes>,
    unavailable: Vec<UnavailableOffering>,
}

/// TTL-cached view of the provider's instance types, one entry per pool.
///
/// Within a TTL the catalog returns the identical Arc, so every
/// simulation in a tick sees the same world. The catalog also owns the
/// insufficient-capacity (ICE) cache: offerings the provider rejected
/// recently read as unavailable until their entry lapses.
pub struct Catalog {
    ttl: Duration,
    ice_ttl: Duration,
    state: Mutex<CatalogState>,
    fetch: tokio::sync::Mutex<()>,
}

impl Catalog {
    pub fn new(ttl: Duration, ice_ttl: Duration) -> Self {
        Self {
            ttl,
            ice_ttl,
            state: Mutex::new(CatalogState {
                by_pool: BTreeMap::new(),
                unavailable: Vec::new(),
            }),
            fetch: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn instance_types(
        &self,
        provider: &CloudProvider,
        pool: &NodePool,
    ) -> Result<Arc<Vec<InstanceType>>, ProviderError> {
        let pool_name = pool.name();
        if let Some(cached) = self.read_cached(&pool_name) {
            return Ok(cached);
        }
        // Serialize provider fetches; a miss storm otherwise fans out
        // identical RPCs.
        let _fetching = self.fetch.lock().await;
        if let Some(cached) = self.read_cached(&pool_name) {
            return Ok(cached);
        }
        let started = Instant::now();
        let types = provider.instance_types(pool).await?;
        info!(
            pool = %pool_name,
            count = types.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refreshed instance type catalog"
        );
        crate::metrics::CATALOG_REFRESH_SECONDS.observe(started.elapsed().as_secs_f64());
        let arc = Arc::new(self.apply_unavailable(types));
        let mut state = self.state.lock().unwrap();
        state.by_pool.insert(
            pool_name,
            CachedTypes {
                fetched_at: Instant::now(),
                types: arc.clone(),
            },
        );
        Ok(arc)
    }

    fn read_cached(&self, pool: &str) -> Option<Arc<Vec<InstanceType>>> {
        let state = self.state.lock().unwrap();
        let cached = state.by_pool.get(pool)?;
        if cached.fetched_at.elapsed() < self.ttl {
            Some(cached.types.clone())
        } else {
            None
        }
    }

    fn apply_unavailable(&self, mut types: Vec<InstanceType>) -> Vec<InstanceType> {
        let mut state = self.state.lock().unwrap();
        state.unavailable.retain(|u| u.until > Instant::now());
        for it in &mut types {
            for o in &mut it.offerings {
                let iced = state.unavailable.iter().any(|u| {
                    u.instance_type == it.name
                        && u.zone == o.zone
                        && u.capacity_type == o.capacity_type
                });
                if iced {
                    o.available = false;
                }
            }
        }
        types
    }

    /// Record an offering the provider just rejected for capacity. The
    /// cached views are rewritten in place so the next simulation already
    /// avoids it.
    pub fn mark_unavailable(&self, instance_type: &str, zone: &str, capacity_type: CapacityType) {
        debug!(instance_type, zone, capacity_type = %capacity_type, "marking offering unavailable");
        let mut state = self.state.lock().unwrap();
        state.unavailable.push(UnavailableOffering {
            instance_type: instance_type.to_string(),
            zone: zone.to_string(),
            capacity_type,
            until: Instant::now() + self.ice_ttl,
        });
        for cached in state.by_pool.values_mut() {
            let mut types = (*cached.types).clone();
            for it in types.iter_mut().filter(|it| it.name == instance_type) {
                for o in &mut it.offerings {
                    if o.zone == zone && o.capacity_type == capacity_type {
                        o.available = false;
                    }
                }
            }
            cached.types = Arc::new(types);
        }
    }

    pub fn invalidate(&self, pool: &str) {
        self.state.lock().unwrap().by_pool.remove(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::PODS;

    fn instance_type(name: &str, cpu_millis: i64, memory_mib: i64, price: f64) -> InstanceType {
        InstanceType {
            name: name.into(),
            arch: "amd64".into(),
            capacity: ResourceList::new()
                .with(CPU, cpu_millis)
                .with(MEMORY, memory_mib * 1024 * 1024 * 1000)
                .with(PODS, 110_000),
            offerings: vec![
                Offering {
                    zone: "a".into(),
                    capacity_type: CapacityType::OnDemand,
                    price,
                    available: true,
                },
                Offering {
                    zone: "b".into(),
                    capacity_type: CapacityType::Spot,
                    price: price * 0.3,
                    available: true,
                },
            ],
        }
    }

    #[test]
    fn allocatable_subtracts_reservations() {
        let it = instance_type("cx22", 2000, 4096, 0.01);
        let alloc = it.allocatable(&OverheadSettings {
            vm_memory_overhead_percent: 0.0,
        });
        assert_eq!(alloc.get(CPU), 1900);
        assert_eq!(alloc.get(MEMORY), (4096 - 100) * 1024 * 1024 * 1000);
        // Pod slots untouched.
        assert_eq!(alloc.get(PODS), 110_000);
    }

    #[test]
    fn vm_overhead_scales_with_memory() {
        let it = instance_type("cx22", 2000, 1000, 0.01);
        let none = it.allocatable(&OverheadSettings {
            vm_memory_overhead_percent: 0.0,
        });
        let some = it.allocatable(&OverheadSettings {
            vm_memory_overhead_percent: 0.1,
        });
        let delta = none.get(MEMORY) - some.get(MEMORY);
        assert_eq!(delta, (1000 * 1024 * 1024 * 1000) / 10);
    }

    #[test]
    fn cheapest_offering_honors_requirements() {
        use crate::requirements::{Operator, Requirement, Requirements};
        let it = instance_type("cx22", 2000, 4096, 0.01);
        // Unconstrained: the spot offering in zone b wins on price.
        let any = Requirements::new();
        assert_eq!(it.cheapest_offering(&any).unwrap().zone, "b");
        // Constrained to on-demand: zone a.
        let od = Requirements::parse(&[Requirement {
            key: LABEL_CAPACITY_TYPE.into(),
            operator: Operator::In,
            values: vec!["on-demand".into()],
            min_values: None,
        }])
        .unwrap();
        assert_eq!(it.cheapest_offering(&od).unwrap().zone, "a");
    }

    #[tokio::test]
    async fn catalog_caches_within_ttl_and_applies_ice() {
        use crate::providers::fake::FakeProvider;
        let provider = CloudProvider::Fake(
            FakeProvider::new().with_instance_types(vec![instance_type("cx22", 2000, 4096, 0.01)]),
        );
        let pool = crate::apis::nodepool::tests_support::minimal_pool("default");
        let catalog = Catalog::new(Duration::from_secs(300), Duration::from_secs(180));

        let first = catalog.instance_types(&provider, &pool).await.unwrap();
        let second = catalog.instance_types(&provider, &pool).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        catalog.mark_unavailable("cx22", "b", CapacityType::Spot);
        let third = catalog.instance_types(&provider, &pool).await.unwrap();
        let spot = third[0]
            .offerings
            .iter()
            .find(|o| o.capacity_type == CapacityType::Spot)
            .unwrap();
        assert!(!spot.available);
    }
}
