#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_tls_engine::{AlpnRejection, ApplicationProtocolList, select_protocol};

/// Fuzz 输入：服务端候选列表与任意客户端 ALPN 提议字节。
///
/// - **Why**：客户端提议来自网络，长度前缀可能被截断或伪造；选择逻辑必须只返回提议缓冲区内的切片。
/// - **How**：候选名称经过合法性过滤后构造列表，提议字节原样交给 `select_protocol`。
/// - **What**：选中结果必须是某个候选名称；`Malformed` 只出现在编码非法的提议上。
#[derive(Debug, Arbitrary)]
struct AlpnCase {
    candidates: Vec<Vec<u8>>,
    offer: Vec<u8>,
}

fn well_formed(mut offer: &[u8]) -> bool {
    while let Some((&len, rest)) = offer.split_first() {
        let len = usize::from(len);
        if len == 0 || len > rest.len() {
            return false;
        }
        offer = &rest[len..];
    }
    true
}

fuzz_target!(|case: AlpnCase| {
    let names = case
        .candidates
        .into_iter()
        .filter(|name| !name.is_empty() && name.len() <= 255);
    let Ok(candidates) = ApplicationProtocolList::from_names(names) else {
        return;
    };

    match select_protocol(&candidates, &case.offer) {
        Ok(selected) => {
            assert!(candidates.iter().any(|c| c.as_bytes() == selected));
            let range = case.offer.as_ptr_range();
            assert!(range.contains(&selected.as_ptr()));
        }
        Err(AlpnRejection::Malformed) => assert!(!well_formed(&case.offer)),
        Err(AlpnRejection::NoOverlap) => assert!(well_formed(&case.offer)),
    }
});
