use ipnet::Ipv4Net;
use lan_monitor_rs::targets::{count_hosts, expand_cidr_to_ips, split_targets};
use std::net::Ipv4Addr;

#[test]
fn expand_excludes_network_and_broadcast() {
    let net = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap();
    let ips = expand_cidr_to_ips(ipnet::IpNet::V4(net));
    let list: Vec<_> = ips
        .into_iter()
        .map(|ip| match ip {
            std::net::IpAddr::V4(v) => v,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(
        list,
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
}

#[test]
fn host_count_for_scan_sizing() {
    assert_eq!(count_hosts("192.168.1.0/24").unwrap(), 254);
    assert_eq!(count_hosts("10.0.0.7/32, 10.0.0.8").unwrap(), 2);
    assert_eq!(count_hosts("fe80::/64").unwrap(), 1);
    assert_eq!(split_targets("a,b,,c"), vec!["a", "b", "c"]);
}
