//! Configuration decoding
//!
//! Two input surfaces collapse into one output: untyped option maps and
//! share-link URIs both become typed outbound descriptors.

mod options;
mod sharelink;
pub mod value;

pub use options::decode_descriptor;
pub use sharelink::{encode_share_link, parse_share_link, rand_user_agent, unique_name};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::ProxyDescriptor;
    use std::collections::HashMap;

    #[test]
    fn test_vless_share_link_decode() {
        let mut names = HashMap::new();
        let link = "vless://uuid@host.example:8443?security=tls&sni=real.example&type=ws&path=%2Fabc&host=front.example&ed=2048#MyNode";
        let descriptor = parse_share_link(link, &mut names).unwrap();

        match descriptor {
            ProxyDescriptor::Vless(o) => {
                assert_eq!(o.name, "MyNode");
                assert_eq!(o.server, "host.example");
                assert_eq!(o.port, 8443);
                assert_eq!(o.uuid, "uuid");
                assert!(o.tls);
                assert_eq!(o.client_fingerprint, "chrome");
                assert_eq!(o.servername, "real.example");
                assert_eq!(o.network, "ws");
                assert_eq!(o.ws_opts.path, "/abc");
                assert_eq!(o.ws_opts.headers.get("Host").unwrap(), "front.example");
                assert!(o.ws_opts.headers.contains_key("User-Agent"));
                assert_eq!(o.ws_opts.max_early_data, 2048);
            }
            other => panic!("wrong kind: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_share_link_port_fallback() {
        let mut names = HashMap::new();
        let no_port = parse_share_link("vless://u@host.example?security=tls#a", &mut names);
        match no_port.unwrap() {
            ProxyDescriptor::Vless(o) => assert_eq!(o.port, 443),
            _ => panic!("wrong kind"),
        }

        let bad_port = parse_share_link("vless://u@host.example:notaport#b", &mut names);
        match bad_port.unwrap() {
            ProxyDescriptor::Vless(o) => assert_eq!(o.port, 443),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn test_share_link_rejects_empty_host() {
        let mut names = HashMap::new();
        assert!(parse_share_link("vless://uuid@:443#x", &mut names).is_err());
        assert!(parse_share_link("not a link", &mut names).is_err());
        assert!(parse_share_link("trojan://pw@host:443#x", &mut names).is_err());
    }

    #[test]
    fn test_share_link_bad_early_data() {
        let mut names = HashMap::new();
        let err = parse_share_link(
            "vless://u@h.example:443?type=ws&ed=soon#x",
            &mut names,
        )
        .unwrap_err();
        assert!(err.to_string().contains("early data"));
    }

    #[test]
    fn test_network_promotion_rules() {
        let mut names = HashMap::new();

        // headerType=http over tcp promotes the network to "http", which
        // carries its options in the h2-opts record
        let promoted = parse_share_link(
            "vless://u@h.example:443?type=tcp&headerType=http&path=%2Fobfs#a",
            &mut names,
        )
        .unwrap();
        match promoted {
            ProxyDescriptor::Vless(o) => {
                assert_eq!(o.network, "http");
                assert_eq!(o.h2_opts.path, vec!["/obfs".to_string()]);
            }
            _ => panic!("wrong kind"),
        }

        // a plain type=http is remapped to h2 and emits no option record
        let remapped = parse_share_link(
            "vless://u@h.example:443?type=http&path=%2Fh2#b",
            &mut names,
        )
        .unwrap();
        match remapped {
            ProxyDescriptor::Vless(o) => {
                assert_eq!(o.network, "h2");
                assert!(o.h2_opts.path.is_empty());
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn test_packet_encoding_rules() {
        let mut names = HashMap::new();

        let default = parse_share_link("vless://u@h.example:443#a", &mut names).unwrap();
        match default {
            ProxyDescriptor::Vless(o) => {
                assert!(o.xudp);
                assert!(!o.packet_addr);
            }
            _ => panic!("wrong kind"),
        }

        let packet = parse_share_link(
            "vless://u@h.example:443?packetEncoding=packet#b",
            &mut names,
        )
        .unwrap();
        match packet {
            ProxyDescriptor::Vless(o) => {
                assert!(o.packet_addr);
                assert!(!o.xudp);
            }
            _ => panic!("wrong kind"),
        }

        let none = parse_share_link(
            "vless://u@h.example:443?packetEncoding=none#c",
            &mut names,
        )
        .unwrap();
        match none {
            ProxyDescriptor::Vless(o) => {
                assert!(!o.packet_addr);
                assert!(!o.xudp);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn test_unique_name() {
        let mut names = HashMap::new();
        assert_eq!(unique_name(&mut names, "node"), "node");
        assert_eq!(unique_name(&mut names, "node"), "node-1");
        assert_eq!(unique_name(&mut names, "node"), "node-2");
        assert_eq!(unique_name(&mut names, "other"), "other");

        // Identical table state yields the same suffixed form
        let mut replay = HashMap::new();
        replay.insert("node".to_string(), 1usize);
        assert_eq!(unique_name(&mut replay, "node"), "node-2");
    }

    #[test]
    fn test_share_link_roundtrip() {
        let links = [
            "vless://uuid@host.example:8443?security=tls&sni=real.example&type=ws&path=%2Fabc&host=front.example&ed=2048#Node",
            "vless://uuid@host.example:443?type=grpc&serviceName=TunSvc#Grpc",
            "vmess://uuid@host.example:443?security=tls&type=tcp#Plain",
            "vless://uuid@host.example:443?type=http&path=%2Fh2&host=h2.example#H2",
        ];

        for link in links {
            let mut names = HashMap::new();
            let first = parse_share_link(link, &mut names).unwrap();

            let encoded = encode_share_link(&first).unwrap();
            let mut names = HashMap::new();
            let second = parse_share_link(&encoded, &mut names).unwrap();

            // The ws User-Agent is drawn at decode time; blank it on both
            // sides before comparing
            let normalize = |d: ProxyDescriptor| match d {
                ProxyDescriptor::Vless(mut o) => {
                    o.ws_opts.headers.remove("User-Agent");
                    if !o.tls {
                        o.client_fingerprint.clear();
                    }
                    ProxyDescriptor::Vless(o)
                }
                ProxyDescriptor::Vmess(mut o) => {
                    o.ws_opts.headers.remove("User-Agent");
                    if !o.tls {
                        o.client_fingerprint.clear();
                    }
                    ProxyDescriptor::Vmess(o)
                }
                other => other,
            };
            assert_eq!(normalize(first), normalize(second), "link: {link}");
        }
    }
}
