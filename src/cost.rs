use crate::model::OperationKind;

pub const FETCH_ENTITY_COST: u64 = 1;
// playlistItems.list + videos.list
pub const FETCH_CHILD_PAGE_COST: u64 = 2;
pub const FETCH_GRANDCHILD_PAGE_COST: u64 = 1;

pub const fn cost(operation: OperationKind) -> u64 {
    match operation {
        OperationKind::FetchEntity => FETCH_ENTITY_COST,
        OperationKind::FetchChildPage => FETCH_CHILD_PAGE_COST,
        OperationKind::FetchGrandchildPage => FETCH_GRANDCHILD_PAGE_COST,
    }
}
