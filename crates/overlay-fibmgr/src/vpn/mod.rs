//! VPN routing data model as read from the routing store.

mod types;

pub use types::{
    EncapType, ExtraRoute, InterVpnLink, InterVpnLinkState, LabelRouteInfo, LinkEndpoint,
    PrefixBinding, PrefixCue, RouteOrigin, RoutePath, RouterInterface, SegmentType, SubnetRoute,
    SwitchState, VpnInstance, VpnToSwitch, VrfEntry,
};
