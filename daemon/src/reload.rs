// Config reload classification (spec.md §4.13). Compares a running
// `engine::config::Config` against a freshly loaded one, field by field,
// and classifies the result as hot-reloadable or restart-required against
// `engine::config::HOT_RELOADABLE_FIELDS`. Loading/merging the new config
// from disk is out of scope here, same as in `engine::config` itself.
use engine::config::{Config, HOT_RELOADABLE_FIELDS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedField {
    pub path: &'static str,
    pub hot_reloadable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReloadPlan {
    pub changed: Vec<ChangedField>,
}

impl ReloadPlan {
    pub fn requires_restart(&self) -> bool {
        self.changed.iter().any(|c| !c.hot_reloadable)
    }

    pub fn is_no_op(&self) -> bool {
        self.changed.is_empty()
    }
}

fn changed(path: &'static str, differs: bool, out: &mut Vec<ChangedField>) {
    if differs {
        out.push(ChangedField { path, hot_reloadable: HOT_RELOADABLE_FIELDS.contains(&path) });
    }
}

// Computes the set of changed fields between `current` and `new`,
// covering every field named in spec.md §4.13's allow-list plus the
// disk/security groups most likely to require a restart when touched.
pub fn classify(current: &Config, new: &Config) -> ReloadPlan {
    let mut out = Vec::new();

    changed("network.listen_port", current.network.listen_port != new.network.listen_port, &mut out);
    changed("network.enable_tcp", current.network.enable_tcp != new.network.enable_tcp, &mut out);
    changed("network.max_global_peers", current.network.max_global_peers != new.network.max_global_peers, &mut out);
    changed("network.connection_timeout", current.network.connection_timeout != new.network.connection_timeout, &mut out);
    changed("discovery.enable_dht", current.discovery.enable_dht != new.discovery.enable_dht, &mut out);
    changed("discovery.dht_port", current.discovery.dht_port != new.discovery.dht_port, &mut out);
    changed("nat.auto_map_ports", current.nat.auto_map_ports != new.nat.auto_map_ports, &mut out);
    changed("nat.enable_nat_pmp", current.nat.enable_nat_pmp != new.nat.enable_nat_pmp, &mut out);
    changed("nat.enable_upnp", current.nat.enable_upnp != new.nat.enable_upnp, &mut out);
    changed("security.ip_filter", current.security.ip_filter != new.security.ip_filter, &mut out);

    // Not in the allow-list: any difference here forces a restart.
    changed("disk.download_dir", current.disk.download_dir != new.disk.download_dir, &mut out);
    changed("disk.preallocate", current.disk.preallocate != new.disk.preallocate, &mut out);
    changed("queue.max_active_torrents", current.queue.max_active_torrents != new.queue.max_active_torrents, &mut out);
    changed("security.enable_tls", current.security.enable_tls != new.security.enable_tls, &mut out);

    ReloadPlan { changed: out }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_configs_produce_no_op_plan() {
        let config = Config::default();
        let plan = classify(&config, &config.clone());
        assert!(plan.is_no_op());
        assert!(!plan.requires_restart());
    }

    #[test]
    fn listen_port_change_is_hot_reloadable() {
        let current = Config::default();
        let mut new = current.clone();
        new.network.listen_port = 6882;
        let plan = classify(&current, &new);
        assert!(!plan.requires_restart());
        assert_eq!(plan.changed[0].path, "network.listen_port");
    }

    #[test]
    fn download_dir_change_requires_restart() {
        let current = Config::default();
        let mut new = current.clone();
        new.disk.download_dir = "/elsewhere".into();
        let plan = classify(&current, &new);
        assert!(plan.requires_restart());
    }
}
