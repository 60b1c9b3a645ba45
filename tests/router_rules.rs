//! Rule-list construction scenarios across the policy surface

use charon::config::RouteConfig;
use charon::policy::CacheRule;
use charon::router::{domain_rule_list, filter_rules, ip_rule_list, DomainClass, Rule};

fn route_cn() -> RouteConfig {
    RouteConfig {
        auto_direct: true,
        auto_direct6: false,
        auto_front: true,
        enable_fake_ca: true,
        block_advertisement: false,
        pac_policy: "smart".to_string(),
        country_code: "CN".to_string(),
    }
}

#[test]
fn white_list_unknown_cache_port_443() {
    // home country, unknown cache, white-listed host, fake CA allowed
    let mut rules = domain_rule_list(DomainClass::HomeWhite);
    filter_rules(&route_cn(), 443, &mut rules);
    assert_eq!(
        rules,
        vec![Rule::Direct, Rule::Front, Rule::Relay, Rule::RedirectHttps]
    );
}

#[test]
fn white_list_without_auto_direct() {
    let mut route = route_cn();
    route.auto_direct = false;
    let mut rules = domain_rule_list(DomainClass::HomeWhite);
    filter_rules(&route, 443, &mut rules);
    assert_eq!(rules, vec![Rule::Front, Rule::Relay]);
}

#[test]
fn hygiene_no_front_when_fake_ca_off_on_443() {
    for class in [
        DomainClass::HomeWhite,
        DomainClass::HomeBlocked { prefer_relay: false },
        DomainClass::HomeDefault,
        DomainClass::Abroad,
        DomainClass::Cached(CacheRule::Front),
    ] {
        let mut route = route_cn();
        route.enable_fake_ca = false;
        let mut rules = domain_rule_list(class);
        filter_rules(&route, 443, &mut rules);
        assert!(
            !rules.contains(&Rule::Front),
            "front must be stripped for {:?}",
            class
        );
    }
}

#[test]
fn hygiene_no_direct_when_auto_direct_off() {
    for class in [
        DomainClass::HomeWhite,
        DomainClass::HomeResolved,
        DomainClass::Cached(CacheRule::Relay),
    ] {
        let mut route = route_cn();
        route.auto_direct = false;
        let mut rules = domain_rule_list(class);
        filter_rules(&route, 80, &mut rules);
        assert!(!rules.contains(&Rule::Direct), "{:?}", class);
        assert!(!rules.contains(&Rule::RedirectHttps), "{:?}", class);
    }
}

#[test]
fn abroad_prefers_relay_over_front() {
    assert_eq!(
        domain_rule_list(DomainClass::Abroad),
        vec![Rule::Direct, Rule::Relay, Rule::Front, Rule::RedirectHttps]
    );
}

#[test]
fn home_resolved_never_offers_front() {
    assert!(!domain_rule_list(DomainClass::HomeResolved).contains(&Rule::Front));
}

#[test]
fn ip_entry_home_region_stays_short() {
    assert_eq!(ip_rule_list(None, true), vec![Rule::Direct, Rule::Relay]);
}
